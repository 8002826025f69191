//! Demo shop instrumented with callscope
//!
//! Four shopper threads check out carts in a loop. Nothing is recorded
//! until a console sends rules.
//!
//! ## Usage
//!
//! ```bash
//! # Start the app with the agent on the default port
//! CALLSCOPE_AGENT="port=7890,snapshotonexit" cargo run --example instrumented-app -- 120
//!
//! # In another terminal: instrument the shop and watch it
//! callscope apply 'shop::*(*) : accept'
//! callscope watch --by exclusive
//! callscope threads --depth 5
//! ```

use callscope::instrument::{Access, MethodDescriptor, MethodProbe, Modifiers};
use callscope::Agent;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ShopProbes {
    checkout: Arc<MethodProbe>,
    price: Arc<MethodProbe>,
    get_discount: Arc<MethodProbe>,
    tax_rate: Arc<MethodProbe>,
    audit: Arc<MethodProbe>,
}

impl ShopProbes {
    fn declare(agent: &Agent) -> anyhow::Result<Self> {
        agent.declare_class(
            "shop::Cart",
            vec![
                MethodDescriptor::public("checkout", &["u32"], Some("u64")),
                MethodDescriptor::public("price", &["u32"], Some("u64")),
                // Skipped with -beanprops:off
                MethodDescriptor::public("get_discount", &[], Some("u64")),
            ],
        );
        agent.declare_class(
            "shop::Tax",
            vec![
                MethodDescriptor::public("rate", &["u32"], Some("u64")),
                // Skipped under the default -access:public
                MethodDescriptor::public("audit", &[], None)
                    .with_modifiers(Modifiers { access: Access::Private, is_static: false }),
            ],
        );

        let probe = |class: &str, method: &str| {
            agent
                .probe(class, method)
                .ok_or_else(|| anyhow::anyhow!("{class}::{method} was not declared"))
        };
        Ok(Self {
            checkout: probe("shop::Cart", "checkout")?,
            price: probe("shop::Cart", "price")?,
            get_discount: probe("shop::Cart", "get_discount")?,
            tax_rate: probe("shop::Tax", "rate")?,
            audit: probe("shop::Tax", "audit")?,
        })
    }
}

fn busy(micros: u64) {
    let until = Instant::now() + Duration::from_micros(micros);
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

fn tax_rate(agent: &Agent, probes: &ShopProbes, region: u32) -> u64 {
    let _call = probes.tax_rate.enter(agent);
    if region % 7 == 0 {
        let _audit = probes.audit.enter(agent);
        busy(300);
    }
    busy(40);
    u64::from(region % 20)
}

fn price(agent: &Agent, probes: &ShopProbes, item: u32) -> u64 {
    let _call = probes.price.enter(agent);
    busy(20 + u64::from(item % 5) * 10);
    u64::from(item) * 100 + tax_rate(agent, probes, item)
}

fn checkout(agent: &Agent, probes: &ShopProbes, items: u32) -> u64 {
    let _call = probes.checkout.enter(agent);
    let subtotal: u64 = (0..items).map(|item| price(agent, probes, item)).sum();
    let discount = {
        let _call = probes.get_discount.enter(agent);
        subtotal / 10
    };
    subtotal - discount
}

fn main() -> anyhow::Result<()> {
    let seconds: u64 = std::env::args().nth(1).map_or(Ok(60), |s| s.parse())?;
    let agent = Agent::launch_from_env()?;
    let probes = Arc::new(ShopProbes::declare(&agent)?);

    if let Some(addr) = agent.local_addr() {
        println!("shop running for {seconds}s, agent on {addr}");
    }

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let shoppers = (0..4)
        .map(|id| {
            let agent = Arc::clone(&agent);
            let probes = Arc::clone(&probes);
            std::thread::Builder::new().name(format!("shopper-{id}")).spawn(move || {
                let mut revenue = 0u64;
                let mut carts = 0u32;
                while Instant::now() < deadline {
                    revenue += checkout(&agent, &probes, 3 + (carts + id) % 8);
                    carts += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
                (carts, revenue)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    for shopper in shoppers {
        if let Ok((carts, revenue)) = shopper.join() {
            println!("shopper done: {carts} carts, revenue {revenue}");
        }
    }

    if let Some(path) = agent.shutdown() {
        println!("snapshot saved to {}", path.display());
    }
    Ok(())
}
