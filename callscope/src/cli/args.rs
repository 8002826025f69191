//! CLI argument definitions

use crate::analysis::HotspotOrder;
use crate::instrument::BUILTIN_DEFAULT_OPTIONS;
use callscope_common::DEFAULT_PORT;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "callscope",
    about = "Console for the callscope in-process call profiler",
    after_help = "\
EXAMPLES:
    callscope apply 'shop::*(*) : accept'           Instrument everything under shop::
    callscope watch --by net --top 20               Live hotspot ranking every 5s
    callscope snapshot -o run1.cs4                  Save the current statistics
    callscope inspect run1.cs4 --tree               Call tree of a saved snapshot
    callscope --port 7000 restore                   Remove all instrumentation"
)]
pub struct Args {
    /// Host of the profiled process
    #[arg(long, global = true, default_value = "127.0.0.1")]
    pub host: String,

    /// Agent command port
    #[arg(short, long, global = true, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Take a snapshot and save it to a file
    Snapshot {
        /// Output file (default: snapshot_<millis>.cs4 in the working directory)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Zero all method statistics
    Reset,

    /// Reclaim call states of terminated threads
    Gc,

    /// Install instrumentation rules and redefine affected classes
    Apply {
        /// Rules like "pattern : action; ...", or @FILE to read them from a file
        #[arg(value_name = "RULES")]
        rules: String,

        /// Default options for every rule
        #[arg(long, default_value = BUILTIN_DEFAULT_OPTIONS, allow_hyphen_values = true)]
        options: String,
    },

    /// Remove all instrumentation
    Restore,

    /// List loaded classes
    Classes {
        /// Only show instrumented classes
        #[arg(long)]
        instrumented: bool,
    },

    /// Show runtime information of the profiled process
    Runtime {
        /// Also print the environment
        #[arg(long)]
        env: bool,
    },

    /// Show memory usage of the profiled process
    Memory,

    /// Show threads and their instrumented call stacks
    Threads {
        /// Kernel thread id to show (repeatable, default: all)
        #[arg(long = "id", value_name = "TID")]
        ids: Vec<i64>,

        /// Maximum stack frames per thread (negative = all)
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        depth: i32,
    },

    /// Toggle thread monitoring features
    Monitor {
        /// Contention monitoring
        #[arg(long, action = ArgAction::Set, default_value_t = false)]
        contention: bool,

        /// Per-thread CPU time
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        cpu_time: bool,
    },

    /// Periodically snapshot and print the top methods
    Watch {
        /// Seconds between snapshots
        #[arg(long, default_value_t = 5)]
        interval: u64,

        /// Ranking: net, self, hits or exclusive
        #[arg(long, default_value = "exclusive")]
        by: HotspotOrder,

        /// Methods to show
        #[arg(long, default_value_t = 10)]
        top: usize,

        /// Stop after N seconds (0 = until Ctrl+C)
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Analyse a saved snapshot file
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Ranking: net, self, hits or exclusive
        #[arg(long, default_value = "exclusive")]
        by: HotspotOrder,

        /// Methods to show
        #[arg(long, default_value_t = 20)]
        top: usize,

        /// Print the call tree instead of the ranking
        #[arg(long)]
        tree: bool,
    },

    /// Export a snapshot as JSON
    Export {
        /// Snapshot file to convert (default: take a live snapshot)
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Leave out hotspots and call tree
        #[arg(long)]
        raw: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_options_after_subcommand() {
        let args = Args::try_parse_from(["callscope", "threads", "--port", "9000", "--depth", "-1"])
            .unwrap();
        assert_eq!(args.port, 9000);
        assert!(matches!(args.command, Command::Threads { depth: -1, .. }));
    }

    #[test]
    fn test_apply_defaults_options() {
        let args = Args::try_parse_from(["callscope", "apply", "a::*(*) : accept"]).unwrap();
        match args.command {
            Command::Apply { options, rules } => {
                assert_eq!(options, BUILTIN_DEFAULT_OPTIONS);
                assert_eq!(rules, "a::*(*) : accept");
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_inspect_parses_ranking() {
        let args =
            Args::try_parse_from(["callscope", "inspect", "s.cs4", "--by", "hits"]).unwrap();
        assert!(matches!(args.command, Command::Inspect { by: HotspotOrder::Hits, .. }));
    }
}
