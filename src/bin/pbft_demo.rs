//! Runs four nodes (`N = 4`, `f = 1`) cooperatively in one process against
//! the in-memory `sim` collaborators, submits one client request, and
//! prints what each node's ledger ends up with.
//!
//! Drives several independent `Node`s by hand, each with its own
//! `SimTransport`/`SimClock` view of one shared `SimWorld` — there is no
//! single process-wide owner of the run.

use log::{info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};

use pbft_core::collab::{NullObserver, Transport};
use pbft_core::ids::ClientId;
use pbft_core::messages::Request;
use pbft_core::monitor::MonitorConfig;
use pbft_core::node::Node;
use pbft_core::sim::{SimClock, SimCrypto, SimLedger, SimPoolConfig, SimTransport, SimWorld};
use pbft_core::suspicion::NoopBlacklistPolicy;

fn init_console_logging() {
    let stdout = ConsoleAppender::builder().build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(LevelFilter::Info))
        .unwrap();
    log4rs::init_config(config).unwrap();
}

fn main() {
    init_console_logging();

    let names: Vec<pbft_core::ids::NodeName> =
        ["n1", "n2", "n3", "n4"].iter().map(|n| (*n).into()).collect();
    let world = SimWorld::new(names.clone(), 0.0, 1, 3);

    // Each node gets its own `SimTransport` for `try_recv` (owned by the
    // `Node`) plus a second handle of the same name the host keeps, used
    // only to actually place that node's `take_outbox()` bytes onto the
    // shared world — `Node` never calls `Transport::send` itself, it only
    // ever buffers into `outbox` for the host to drain.
    let mut senders: Vec<SimTransport> = Vec::with_capacity(names.len());
    let mut nodes: Vec<Node> = Vec::with_capacity(names.len());
    for name in &names {
        let pool = Box::new(SimPoolConfig::new(name.clone(), names.clone()));
        let transport = Box::new(SimTransport::new(name.clone(), world.clone()));
        let clock = Box::new(SimClock::new(world.clone()));
        let crypto = Box::new(SimCrypto::new(name.clone()));
        let ledger = Box::new(SimLedger::new());
        let observer = Box::new(NullObserver::default());
        let blacklist = Box::new(NoopBlacklistPolicy::default());
        nodes.push(Node::new(
            pool,
            transport,
            clock,
            crypto,
            ledger,
            observer,
            blacklist,
            MonitorConfig::default(),
        ));
        senders.push(SimTransport::new(name.clone(), world.clone()));
    }

    info!("submitting client request to every node's instance set via n1");
    nodes[0].submit_client_request(Request {
        client: ClientId::from("alice"),
        req_id: 1,
        operation: b"SET x = 1".to_vec(),
        signature: Vec::new(),
    });

    for round in 0..50 {
        world.borrow_mut().advance(1);
        for (node, sender) in nodes.iter_mut().zip(senders.iter_mut()) {
            for outbound in node.take_outbox() {
                sender.send(outbound.to, outbound.bytes);
            }
            node.drain(16).expect("fatal node error");
        }
        if nodes.iter().all(|n| n.ledger().latest_seq().0 > 0) {
            info!("all nodes committed by round {}", round);
            break;
        }
    }

    for (name, node) in names.iter().zip(nodes.iter()) {
        info!("{}: view={} ledger={:?}", name, node.view(), node.ledger().snapshot());
    }
}
