use fdmlink_communication::{MockDevice, Sender, SenderConfig};
use proptest::prelude::*;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Command(usize),
    Fill,
    Ack,
    Resend(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..24).prop_map(Op::Command),
        Just(Op::Fill),
        Just(Op::Ack),
        Just(Op::Ack),
        (0u64..40).prop_map(Op::Resend),
    ]
}

fn sender(capacity: usize, device: &MockDevice) -> Sender {
    let sender = Sender::new(SenderConfig {
        window_capacity: capacity,
        ..SenderConfig::default()
    });
    sender.attach(Box::new(device.port(
        "/dev/ttyMOCK0",
        250000,
        Duration::from_millis(10),
    )));
    sender
}

fn program(len: usize) -> Vec<String> {
    let mut lines = vec!["M110".to_string()];
    lines.extend((1..len).map(|i| format!("G1 X{} Y{}", i, i * 2)));
    lines
}

fn assert_window(sender: &Sender) {
    assert!(sender.bytes_sent() < sender.capacity());
    assert_eq!(sender.bytes_sent(), sender.in_flight_bytes());
}

proptest! {
    #[test]
    fn window_never_exceeds_capacity(
        capacity in 48usize..256,
        len in 1usize..40,
        ops in prop::collection::vec(op(), 1..120),
    ) {
        let device = MockDevice::new();
        let sender = sender(capacity, &device);
        sender.load_program(program(len));

        for op in ops {
            match op {
                Op::Command(width) => {
                    let _ = sender.enqueue_command(&format!("M117 {}", "x".repeat(width)), false);
                }
                Op::Fill => {
                    sender.fill_window(None).unwrap();
                }
                Op::Ack => {
                    sender.acknowledge();
                }
                Op::Resend(sequence) => {
                    let _ = sender.handle_resend(sequence);
                }
            }
            prop_assert!(sender.bytes_sent() < capacity);
            prop_assert_eq!(sender.bytes_sent(), sender.in_flight_bytes());
        }
    }

    #[test]
    fn resend_twice_gives_same_state(len in 2usize..30, at in 0u64..30) {
        let device = MockDevice::new();
        let sender = sender(128, &device);
        sender.load_program(program(len));
        sender.fill_window(None).unwrap();

        let first = sender.handle_resend(at).map(|_| sender.position());
        let second = sender.handle_resend(at).map(|_| sender.position());
        prop_assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(first), Ok(second)) = (first, second) {
            prop_assert_eq!(first, at as usize);
            prop_assert_eq!(second, at as usize);
        }
        prop_assert_eq!(sender.in_flight_len(), 0);
        prop_assert_eq!(sender.pending_len(), 0);
        prop_assert_eq!(sender.bytes_sent(), 0);
    }
}

#[test]
fn test_two_lines_then_two_oks() {
    let device = MockDevice::new();
    let sender = sender(240, &device);
    sender.load_program(vec!["G1 X10 Y10".to_string(), "G1 X20 Y20".to_string()]);

    let report = sender.fill_window(None).unwrap();
    assert_eq!(report.program_lines, 2);
    assert!(report.program_finished);
    assert_eq!(sender.in_flight_len(), 2);

    assert!(sender.acknowledge());
    assert!(sender.acknowledge());
    assert_eq!(sender.bytes_sent(), 0);
    assert_eq!(sender.in_flight_len(), 0);
    assert_eq!(sender.position(), 2);
    assert_eq!(
        device.written_lines(),
        vec!["N0 G1 X10 Y10*41", "N1 G1 X20 Y20*40"]
    );
}

#[test]
fn test_surplus_ok_does_not_desync_budget() {
    let device = MockDevice::new();
    let sender = sender(128, &device);
    sender.load_program(program(3));
    sender.fill_window(None).unwrap();
    assert_eq!(sender.in_flight_len(), 3);

    // A coalesced or duplicated ok arrives: one more than lines in flight.
    for _ in 0..3 {
        assert!(sender.acknowledge());
    }
    assert!(!sender.acknowledge());
    assert_window(&sender);
    assert_eq!(sender.bytes_sent(), 0);

    sender.enqueue_command("M105", false).unwrap();
    assert_eq!(sender.bytes_sent(), "M105\n".len());
    assert_window(&sender);
}

#[test]
fn test_early_ok_releases_oldest_entry_only() {
    let device = MockDevice::new();
    let sender = sender(128, &device);
    sender.enqueue_command("M105", false).unwrap();
    sender.enqueue_command("G28 X0 Y0", false).unwrap();
    let total = sender.bytes_sent();

    // Acknowledgments are matched in transmit order, whatever line they were meant for.
    assert!(sender.acknowledge());
    assert_eq!(sender.bytes_sent(), total - "M105\n".len());
    assert_window(&sender);
}
