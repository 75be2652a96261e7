//! Loopback tests: the daemon's transaction loop wired to a real
//! `spibridge-engine` over an in-memory bus.
//!
//! The `SimHandle` pair implements the daemon's bus and SYNC seams and
//! plays the MCU's interrupt glue: SYNC edges and transfer completions are
//! forwarded to the engine exactly as the hardware would deliver them.
//! Every byte both sides exchange therefore goes through both production
//! codebases, which is what the protocol's "agree without negotiation"
//! invariant demands.

use std::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use spibridge_daemon::{
    BridgeDaemon, CycleOutcome, DaemonConfig, DaemonError, Segment, SpiBus, SyncControl,
};
use spibridge_engine::{Action, BridgeEngine, BridgeState, Completion};
use spibridge_icd::{ControlPkt, Direction, TransferPlan};

struct McuSim {
    engine: BridgeEngine,
    /// Plan returned by the engine for the cycle in flight.
    plan: Option<TransferPlan>,
    /// Everything the engine's consumers would have been told.
    completions: Vec<Completion>,
    /// Corrupt the next ack header's cmd byte to this value.
    corrupt_next_ack: Option<u8>,
    /// Corrupt every ack header until cleared.
    corrupt_all_acks: bool,
}

impl McuSim {
    fn new() -> Self {
        let mut engine = BridgeEngine::new();
        engine.init();
        Self {
            engine,
            plan: None,
            completions: Vec::new(),
            corrupt_next_ack: None,
            corrupt_all_acks: false,
        }
    }
}

#[derive(Clone)]
struct SimHandle(Rc<RefCell<McuSim>>);

impl SyncControl for SimHandle {
    fn set(&mut self, high: bool) -> spibridge_daemon::Result<()> {
        let mut sim = self.0.borrow_mut();
        if high {
            sim.engine.sync_rising();
        } else {
            // Falling edge aborts anything in flight, like the DMA abort in
            // the real binding layer.
            sim.plan = None;
            let _ = sim.engine.sync_falling();
        }
        Ok(())
    }
}

impl SpiBus for SimHandle {
    fn transfer(&mut self, segments: &mut [Segment<'_>]) -> spibridge_daemon::Result<()> {
        let mut sim = self.0.borrow_mut();

        if sim.engine.state() == BridgeState::Ctrl {
            // Header exchange. Both directions move in the same bus
            // transaction, so the ack bytes are captured before the engine
            // parses the request, exactly like the full-duplex wire.
            let mut ack = sim.engine.outgoing_header().to_bytes();
            if let Some(cmd) = sim.corrupt_next_ack.take() {
                ack[0] = cmd;
            }
            if sim.corrupt_all_acks {
                ack[0] = 0x00;
            }

            match segments {
                [Segment::Write(tx), Segment::Read(rx)] => {
                    let mut raw = [0u8; ControlPkt::WIRE_SIZE];
                    raw.copy_from_slice(tx);
                    rx.copy_from_slice(&ack);

                    let (action, comps) = sim.engine.header_received(&raw);
                    sim.completions.extend(comps.iter().copied());
                    if let Action::StartData(plan) = action {
                        sim.plan = Some(plan);
                    }
                }
                _ => panic!("unexpected header message shape"),
            }
        } else {
            // Data phase: both sides must have derived the same descriptor
            // list from the same header pair.
            let plan = sim.plan.take().expect("data phase without an agreed plan");
            assert_eq!(segments.len(), plan.len(), "descriptor lists disagree");

            for (segment, t) in segments.iter_mut().zip(plan.iter()) {
                let len = t.len as usize;
                match (segment, t.direction) {
                    (Segment::Write(data), Direction::SocToMcu) => {
                        assert_eq!(data.len(), len, "descriptor length disagrees");
                        sim.engine.incoming_mut(t.channel)[..len].copy_from_slice(data);
                    }
                    (Segment::Read(buf), Direction::McuToSoc) => {
                        assert_eq!(buf.len(), len, "descriptor length disagrees");
                        buf.copy_from_slice(&sim.engine.outgoing(t.channel)[..len]);
                    }
                    _ => panic!("descriptor direction disagrees"),
                }
            }

            let comps = sim.engine.data_complete();
            sim.completions.extend(comps.iter().copied());
        }

        Ok(())
    }
}

fn setup(
    name: &str,
    max_retries: u32,
) -> (
    BridgeDaemon<SimHandle, SimHandle>,
    Rc<RefCell<McuSim>>,
    PathBuf,
) {
    let dir = std::env::temp_dir().join(format!(
        "spibridge-loopback-{}-{}",
        std::process::id(),
        name
    ));
    let _ = std::fs::remove_dir_all(&dir);

    let sim = Rc::new(RefCell::new(McuSim::new()));
    let config = DaemonConfig::new(&dir)
        .with_poll_timeout_ms(20)
        .with_max_retries(max_retries);
    let daemon = BridgeDaemon::new(
        SimHandle(sim.clone()),
        SimHandle(sim.clone()),
        None,
        config,
    )
    .expect("daemon setup");

    (daemon, sim, dir)
}

fn connect(dir: &PathBuf, name: &str) -> UnixStream {
    let stream = UnixStream::connect(dir.join(name)).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    stream
}

fn opened(completions: &[Completion], channel: usize) -> usize {
    completions
        .iter()
        .filter(|c| **c == Completion::Opened(channel))
        .count()
}

#[test]
fn idle_cycles_move_nothing() {
    let (mut daemon, sim, _dir) = setup("idle", 500);

    for _ in 0..3 {
        let outcome = daemon.cycle().unwrap();
        assert_eq!(
            outcome,
            CycleOutcome {
                desync: false,
                transfers: 0
            }
        );
    }
    assert!(sim.borrow().completions.is_empty());
    assert_eq!(sim.borrow().engine.state(), BridgeState::Idle);
}

#[test]
fn port_a_duplex_round_trip() {
    let (mut daemon, sim, dir) = setup("duplex", 500);

    {
        let mut sim = sim.borrow_mut();
        sim.engine.enable(1);
        sim.engine.start_out(1);
        sim.engine.start_in(1, b"0123456789");
    }

    let mut client = connect(&dir, "1");
    client.write_all(b"hello").unwrap();

    // Cycle 1: the connection is accepted; the open edge crosses, but no
    // payload does because readiness was only just established.
    let outcome = daemon.cycle().unwrap();
    assert_eq!(outcome.transfers, 0);
    assert_eq!(opened(&sim.borrow().completions, 1), 1);

    // Cycle 2: socket bytes and queued MCU bytes cross in one data phase.
    let outcome = daemon.cycle().unwrap();
    assert_eq!(outcome.transfers, 2);

    let mut got = [0u8; 10];
    client.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"0123456789");

    let sim = sim.borrow();
    assert_eq!(&sim.engine.incoming(1)[..5], b"hello");
    assert!(sim
        .completions
        .contains(&Completion::Out { channel: 1, len: 5 }));
    assert!(sim.completions.contains(&Completion::In(1)));
}

#[test]
fn full_buffer_crosses_intact() {
    let (mut daemon, sim, dir) = setup("full", 500);

    let payload: Vec<u8> = (0..255u32).map(|i| (i * 31 % 251) as u8).collect();
    {
        let mut sim = sim.borrow_mut();
        sim.engine.enable(1);
        sim.engine.start_out(1);
    }

    let mut client = connect(&dir, "1");
    client.write_all(&payload).unwrap();

    daemon.cycle().unwrap(); // accept
    daemon.cycle().unwrap(); // drain + transfer

    let sim = sim.borrow();
    assert!(sim.completions.contains(&Completion::Out {
        channel: 1,
        len: 255
    }));
    assert_eq!(&sim.engine.incoming(1)[..255], payload.as_slice());
}

#[test]
fn peer_observes_open_edge_exactly_once() {
    let (mut daemon, sim, dir) = setup("openedge", 500);

    let _client = connect(&dir, "2");
    for _ in 0..4 {
        daemon.cycle().unwrap();
    }

    // The bit stays set across cycles but the edge is delivered once.
    assert_eq!(opened(&sim.borrow().completions, 2), 1);
}

#[test]
fn desynchronized_header_skips_one_cycle() {
    let (mut daemon, sim, dir) = setup("desync", 500);

    {
        let mut sim = sim.borrow_mut();
        sim.engine.enable(1);
        sim.engine.start_out(1);
        sim.engine.start_in(1, b"xyz");
    }
    let mut client = connect(&dir, "1");
    client.write_all(b"abc").unwrap();

    daemon.cycle().unwrap(); // accept

    // One corrupted ack: the daemon drops the cycle, touches no socket.
    sim.borrow_mut().corrupt_next_ack = Some(0x00);
    let outcome = daemon.cycle().unwrap();
    assert!(outcome.desync);
    assert_eq!(outcome.transfers, 0);
    assert_eq!(daemon.retries(), 1);

    let mut buf = [0u8; 8];
    let err = client.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

    // The immediately following cycle proceeds normally with the same data.
    let outcome = daemon.cycle().unwrap();
    assert!(!outcome.desync);
    assert_eq!(outcome.transfers, 2);
    assert_eq!(daemon.retries(), 0);

    let mut got = [0u8; 3];
    client.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"xyz");
    assert_eq!(&sim.borrow().engine.incoming(1)[..3], b"abc");
}

#[test]
fn retry_ceiling_is_fatal() {
    let (mut daemon, sim, _dir) = setup("fatal", 3);

    sim.borrow_mut().corrupt_all_acks = true;
    for expected in 1..=3u32 {
        let outcome = daemon.cycle().unwrap();
        assert!(outcome.desync);
        assert_eq!(daemon.retries(), expected);
    }

    match daemon.cycle() {
        Err(DaemonError::ExcessiveRetries { count }) => assert_eq!(count, 4),
        other => panic!("expected ExcessiveRetries, got {:?}", other),
    }
}

#[test]
fn usb_channel_connects_on_peer_enable() {
    let (mut daemon, sim, dir) = setup("usb", 500);

    // The process-execution daemon's listening socket.
    let usb_listener = UnixListener::bind(dir.join("usb")).unwrap();

    sim.borrow_mut().engine.enable(0);
    daemon.cycle().unwrap();
    assert_eq!(daemon.peer_open_mask() & 1, 1);

    let (mut usb_peer, _) = usb_listener.accept().expect("daemon connected outward");
    usb_peer
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    // Traffic flows both ways once connected.
    {
        let mut sim = sim.borrow_mut();
        sim.engine.start_out(0);
        sim.engine.start_in(0, b"usb-data");
    }
    usb_peer.write_all(b"to-mcu").unwrap();

    daemon.cycle().unwrap();
    let mut got = [0u8; 8];
    usb_peer.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"usb-data");
    assert_eq!(&sim.borrow().engine.incoming(0)[..6], b"to-mcu");

    // Peer disable closes the outward connection.
    sim.borrow_mut().engine.disable(0);
    daemon.cycle().unwrap();
    assert_eq!(usb_peer.read(&mut got).unwrap(), 0);
}

#[test]
fn peer_disable_drops_listener_connection() {
    let (mut daemon, sim, dir) = setup("peerdrop", 500);

    sim.borrow_mut().engine.enable(2);
    let mut client = connect(&dir, "2");
    daemon.cycle().unwrap(); // accept; both open bits now set
    daemon.cycle().unwrap();

    sim.borrow_mut().engine.disable(2);
    daemon.cycle().unwrap();

    // The daemon closed our connection and went back to listening.
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap(), 0);
    let _client2 = connect(&dir, "2");
    daemon.cycle().unwrap();
}

#[test]
fn hangup_rearms_listener() {
    let (mut daemon, sim, dir) = setup("hangup", 500);

    let client = connect(&dir, "1");
    daemon.cycle().unwrap();
    assert_eq!(opened(&sim.borrow().completions, 1), 1);

    drop(client);
    daemon.cycle().unwrap();
    assert!(sim.borrow().completions.contains(&Completion::Closed(1)));

    // A fresh connection is accepted and the open edge fires again.
    let _client2 = connect(&dir, "1");
    daemon.cycle().unwrap();
    assert_eq!(opened(&sim.borrow().completions, 1), 2);
}
