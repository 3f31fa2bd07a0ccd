use gearline::dispatch::{Claim, DispatchChain, Dispatched, Handler};
use gearline::error::ProtocolError;
use gearline::protocol::{Frame, Magic, PacketType};

/// Records which handlers saw which frames.
#[derive(Default)]
struct Log {
    seen: Vec<(&'static str, PacketType)>,
}

/// Claims frames of one packet type; finishes after `uses` claims.
struct Matcher {
    name: &'static str,
    packet: PacketType,
    uses: Option<usize>,
}

impl Matcher {
    fn persistent(name: &'static str, packet: PacketType) -> Self {
        Self {
            name,
            packet,
            uses: None,
        }
    }

    fn once(name: &'static str, packet: PacketType) -> Self {
        Self {
            name,
            packet,
            uses: Some(1),
        }
    }
}

impl Handler<Log> for Matcher {
    fn try_handle(&mut self, frame: &Frame, log: &mut Log) -> Result<Claim, ProtocolError> {
        log.seen.push((self.name, frame.packet()));
        if frame.packet() != self.packet {
            return Ok(Claim::Unclaimed);
        }
        match self.uses.as_mut() {
            None => Ok(Claim::Claimed),
            Some(left) => {
                *left -= 1;
                Ok(if *left == 0 {
                    Claim::Finished
                } else {
                    Claim::Claimed
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Claims everything and fails.
struct Broken;

impl Handler<Log> for Broken {
    fn try_handle(&mut self, frame: &Frame, _log: &mut Log) -> Result<Claim, ProtocolError> {
        Err(ProtocolError::UnexpectedPacket(frame.packet()))
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

fn noop() -> Frame {
    Frame::bare(Magic::Response, PacketType::Noop)
}

fn no_job() -> Frame {
    Frame::bare(Magic::Response, PacketType::NoJob)
}

#[test]
fn test_first_claim_wins_in_registration_order() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::persistent("first", PacketType::Noop));
    chain.push(Matcher::persistent("second", PacketType::Noop));

    let mut log = Log::default();
    assert_eq!(chain.dispatch(&noop(), &mut log).unwrap(), Dispatched::Kept);
    assert_eq!(log.seen, vec![("first", PacketType::Noop)]);
}

#[test]
fn test_unclaimed_frames_fall_through() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::persistent("noop", PacketType::Noop));
    chain.push(Matcher::persistent("no-job", PacketType::NoJob));

    let mut log = Log::default();
    chain.dispatch(&no_job(), &mut log).unwrap();
    assert_eq!(
        log.seen,
        vec![("noop", PacketType::NoJob), ("no-job", PacketType::NoJob)]
    );
}

#[test]
fn test_unclaimed_by_everyone_is_a_protocol_error() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::persistent("noop", PacketType::Noop));

    let err = chain.dispatch(&no_job(), &mut Log::default()).unwrap_err();
    assert_eq!(err, ProtocolError::Unclaimed(PacketType::NoJob));

    let mut empty: DispatchChain<Log> = DispatchChain::new();
    assert!(empty.dispatch(&noop(), &mut Log::default()).is_err());
}

#[test]
fn test_finished_handler_removes_itself() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::persistent("wake", PacketType::Noop));
    chain.push(Matcher::once("grab", PacketType::NoJob));
    assert_eq!(chain.handler_names(), vec!["wake", "grab"]);

    let mut log = Log::default();
    assert_eq!(
        chain.dispatch(&no_job(), &mut log).unwrap(),
        Dispatched::Removed { idle: false }
    );
    assert_eq!(chain.handler_names(), vec!["wake"]);
    assert!(chain.dispatch(&no_job(), &mut log).is_err());
}

#[test]
fn test_removing_the_last_handler_reports_idle() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::once("created", PacketType::JobCreated));

    let frame = Frame::response(PacketType::JobCreated, ["H:test:1"]);
    assert_eq!(
        chain.dispatch(&frame, &mut Log::default()).unwrap(),
        Dispatched::Removed { idle: true }
    );
    assert!(chain.is_empty());
}

#[test]
fn test_concurrent_exchanges_of_the_same_type_are_served_in_order() {
    let mut chain = DispatchChain::new();
    chain.push(Matcher::once("a", PacketType::JobCreated));
    chain.push(Matcher::once("b", PacketType::JobCreated));

    let frame = Frame::response(PacketType::JobCreated, ["H:test:1"]);
    let mut log = Log::default();
    chain.dispatch(&frame, &mut log).unwrap();
    assert_eq!(chain.handler_names(), vec!["b"]);
    chain.dispatch(&frame, &mut log).unwrap();
    assert!(chain.is_empty());
}

#[test]
fn test_handler_error_keeps_handler_registered() {
    let mut chain = DispatchChain::new();
    chain.push(Broken);
    chain.push(Matcher::persistent("never", PacketType::Noop));

    let mut log = Log::default();
    let err = chain.dispatch(&noop(), &mut log).unwrap_err();
    assert_eq!(err, ProtocolError::UnexpectedPacket(PacketType::Noop));
    assert!(log.seen.is_empty());
    assert_eq!(chain.len(), 2);
}
