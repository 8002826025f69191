use callscope::domain::ClientError;
use callscope::engine::{ManualClock, ReloadProgress};
use callscope::instrument::{Access, MethodDescriptor, Modifiers};
use callscope::remote::{server, Client, MemoryUsage};
use callscope::{Agent, AgentConfig};
use callscope_common::wire::{read_i32, read_utf};
use callscope_common::{Command, AGENT_VERSION, STATUS_ACK, STATUS_ERROR, STATUS_UNKNOWN_COMMAND};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    max: Option<usize>,
    values: Vec<usize>,
}

impl ReloadProgress for Recorder {
    fn set_max_value(&mut self, max: usize) {
        self.max = Some(max);
    }

    fn set_value(&mut self, value: usize) {
        self.values.push(value);
    }
}

fn surviving_config() -> AgentConfig {
    AgentConfig { port: 0, exit_on_failure: false, ..AgentConfig::default() }
}

fn start_agent() -> (Arc<Agent>, Arc<ManualClock>, u16) {
    start_agent_with(surviving_config())
}

fn start_agent_with(config: AgentConfig) -> (Arc<Agent>, Arc<ManualClock>, u16) {
    let clock = Arc::new(ManualClock::new(0));
    let agent = Agent::with_clock(config, clock.clone());
    agent.declare_class(
        "shop::Cart",
        vec![
            MethodDescriptor::public("checkout", &["u32"], Some("u64")),
            MethodDescriptor::public("price", &["u32"], Some("u64")),
        ],
    );
    agent.declare_class(
        "shop::Ledger",
        vec![MethodDescriptor::public("audit", &[], None)
            .with_modifiers(Modifiers { access: Access::Private, is_static: false })],
    );
    let addr = server::spawn(Arc::clone(&agent), 0).unwrap();
    (agent, clock, addr.port())
}

fn connect(port: u16) -> Client {
    let mut client = Client::new();
    client.connect("127.0.0.1", port).unwrap();
    client
}

#[test]
fn test_apply_rules_then_snapshot() {
    let (agent, clock, port) = start_agent();
    let mut client = connect(port);

    let mut progress = Recorder::default();
    client.apply_rules("", "shop::*(*) : accept", &mut progress).unwrap();
    assert_eq!(progress.max, Some(2));
    assert!(progress.values.is_empty());

    let checkout = agent.probe("shop::Cart", "checkout").unwrap();
    let price = agent.probe("shop::Cart", "price").unwrap();
    {
        let _checkout = checkout.enter(agent.as_ref());
        clock.advance(5);
        {
            let _price = price.enter(agent.as_ref());
            clock.advance(10);
        }
        clock.advance(15);
    }

    let snapshot = client.snapshot().unwrap();
    let checkout = snapshot.find("shop::Cart::checkout(u32)").unwrap();
    assert_eq!((checkout.hits, checkout.net_time_ns), (1, 30));
    assert_eq!(checkout.child_time_ns(), 10);
    let price = snapshot.find("shop::Cart::price(u32)").unwrap();
    assert_eq!((price.hits, price.net_time_ns), (1, 10));

    client.reset_stats().unwrap();
    assert!(client.snapshot().unwrap().is_empty());

    client.disconnect().unwrap();
    assert!(!client.is_connected());
}

#[test]
fn test_class_listing_follows_rules() {
    let (_agent, _clock, port) = start_agent();
    let mut client = connect(port);

    let classes = client.list_classes().unwrap();
    assert_eq!(classes.len(), 2);
    assert!(classes.iter().all(|c| !c.instrumented));

    client.apply_rules("", "shop::Cart::*(*) : accept", &mut Recorder::default()).unwrap();
    let classes = client.list_classes().unwrap();
    let cart = classes.iter().find(|c| c.name == "shop::Cart").unwrap();
    let ledger = classes.iter().find(|c| c.name == "shop::Ledger").unwrap();
    assert!(cart.instrumented);
    assert!(!ledger.instrumented);

    client.restore_classes(&mut Recorder::default()).unwrap();
    assert!(client.list_classes().unwrap().iter().all(|c| !c.instrumented));
}

#[test]
fn test_rejected_rules_keep_connection() {
    let (agent, _clock, port) = start_agent();
    let mut client = connect(port);

    let err = client
        .apply_rules("", "shop::*(*) : maybe", &mut Recorder::default())
        .unwrap_err();
    assert!(matches!(err, ClientError::CommandFailed { status: STATUS_ERROR, .. }));
    assert!(client.is_connected());
    assert!(agent.controller().current_rules().rules_text().is_empty());

    // Still in sync with the agent
    client.gc().unwrap();
}

#[test]
fn test_process_introspection() {
    let (agent, _clock, port) = start_agent();
    let mut client = connect(port);
    client.apply_rules("", "shop::*(*) : accept", &mut Recorder::default()).unwrap();

    let runtime = client.runtime_info().unwrap();
    assert!(runtime.name.starts_with(&std::process::id().to_string()));
    assert!(runtime.uptime_ms >= 0);

    let memory = client.memory_info().unwrap();
    assert_eq!(memory.heap.max, MemoryUsage::UNDEFINED);
    assert_eq!(memory.pending_finalization, 0);

    assert_eq!(client.set_thread_monitoring(true, true).unwrap(), (false, true));

    let checkout = agent.probe("shop::Cart", "checkout").unwrap();
    let _open = checkout.enter(agent.as_ref());
    let threads = client.thread_info(&[], -1).unwrap();
    assert!(threads.iter().any(|t| t.name == server::SERVER_THREAD_NAME));
    let busy = threads.iter().find(|t| !t.stack.is_empty()).unwrap();
    assert_eq!(busy.stack, vec!["shop::Cart::checkout(u32)".to_string()]);

    let only = client.thread_info(&[busy.id], 0).unwrap();
    assert_eq!(only.len(), 1);
    assert!(only[0].stack.is_empty());
}

#[test]
fn test_unknown_command_is_answered() {
    let (_agent, _clock, port) = start_agent();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(read_utf(&mut stream).unwrap(), AGENT_VERSION);

    stream.write_all(&99i32.to_be_bytes()).unwrap();
    assert_eq!(read_i32(&mut stream).unwrap(), STATUS_UNKNOWN_COMMAND);

    stream.write_all(&Command::Disconnect.code().to_be_bytes()).unwrap();
    assert_eq!(read_i32(&mut stream).unwrap(), STATUS_ACK);
}

#[test]
fn test_commands_need_connection() {
    let mut client = Client::new();
    assert!(matches!(client.snapshot(), Err(ClientError::NotConnected)));
    assert!(matches!(client.disconnect(), Err(ClientError::NotConnected)));
}

#[test]
fn test_aborted_reload_is_reported_as_failure() {
    let config = AgentConfig { max_methods: 1, ..surviving_config() };
    let (agent, _clock, port) = start_agent_with(config);
    let mut client = connect(port);

    let err = client
        .apply_rules("", "shop::*(*) : accept", &mut Recorder::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::CommandFailed { command, status: STATUS_ERROR }
            if command == Command::ApplyRules.code()
    ));
    assert!(client.is_connected());
    // The surviving agent keeps recording with whatever was redefined
    assert!(agent.profiler().is_enabled());
    client.gc().unwrap();
}

#[test]
fn test_server_accepts_again_after_aborted_connection() {
    let (_agent, _clock, port) = start_agent();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(read_utf(&mut stream).unwrap(), AGENT_VERSION);
    // ApplyRules with an options string cut off after 3 of 40 bytes
    stream.write_all(&Command::ApplyRules.code().to_be_bytes()).unwrap();
    stream.write_all(&40u16.to_be_bytes()).unwrap();
    stream.write_all(b"-ac").unwrap();
    drop(stream);

    let mut client = connect(port);
    assert!(client.snapshot().unwrap().is_empty());
    client.disconnect().unwrap();
}

#[test]
fn test_garbage_command_stream_is_survived() {
    let (_agent, _clock, port) = start_agent();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert_eq!(read_utf(&mut stream).unwrap(), AGENT_VERSION);
    // GetThreadInfo with a negative id count is a protocol error
    stream.write_all(&Command::GetThreadInfo.code().to_be_bytes()).unwrap();
    assert_eq!(read_i32(&mut stream).unwrap(), STATUS_ACK);
    stream.write_all(&(-5i32).to_be_bytes()).unwrap();
    let mut rest = Vec::new();
    // The agent closes the connection without answering
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    let mut client = connect(port);
    assert_eq!(client.set_thread_monitoring(false, true).unwrap(), (false, true));
}
