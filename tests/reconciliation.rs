use std::{cell::RefCell, rc::Rc};

use sequitur::{
    bb84::{KeyPool, NoisySource},
    cascade::{Cascade, CascadeMsg, Role, SAMPLE_LEN},
    channel::ClassicalChannel,
    event::EntityId,
    key::Key,
    timeline::{Context, Entity, Timeline},
    Message,
};

const DELAY: u64 = 5;

struct Pair {
    timeline: Timeline<Message>,
    sender: Rc<RefCell<Cascade>>,
    receiver: Rc<RefCell<Cascade>>,
    sender_id: EntityId,
    receiver_id: EntityId,
}

fn pair_with<O: Entity<Message> + 'static>(
    make_oracle: impl FnOnce(EntityId, EntityId) -> O,
) -> anyhow::Result<Pair> {
    // opt into protocol traces with e.g. RUST_LOG=debug
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let mut timeline = Timeline::new();
    let sender_id = timeline.register("alice.cascade")?;
    let receiver_id = timeline.register("bob.cascade")?;
    let oracle_id = timeline.register("bb84")?;
    let sender = Rc::new(RefCell::new(Cascade::new(Role::Sender, oracle_id)));
    let receiver = Rc::new(RefCell::new(Cascade::new(Role::Receiver, oracle_id)));
    ClassicalChannel::new(DELAY, sender_id, receiver_id)
        .wire(&mut sender.borrow_mut(), &mut receiver.borrow_mut());
    timeline.install(sender_id, sender.clone())?;
    timeline.install(receiver_id, receiver.clone())?;
    timeline.install(oracle_id, make_oracle(sender_id, receiver_id))?;
    Ok(Pair {
        timeline,
        sender,
        receiver,
        sender_id,
        receiver_id,
    })
}

impl Pair {
    fn reconcile(&mut self, keylen: usize) -> anyhow::Result<()> {
        self.timeline.init()?;
        self.timeline
            .schedule(0, self.sender_id, CascadeMsg::GenerateKey { keylen })?;
        self.timeline.run()
    }

    fn assert_settled(&self) {
        let (sender, receiver) = (self.sender.borrow(), self.receiver.borrow());
        assert_eq!(sender.role(), Role::Sender);
        assert_eq!(receiver.role(), Role::Receiver);
        assert!(sender.finished() && receiver.finished());
        // termination stays latent: both sides sit one past the last pass
        assert_eq!(sender.state(), sender.passes() + 1);
        assert_eq!(receiver.state(), receiver.passes() + 1);
        assert_eq!(sender.key(), receiver.key());
        assert!(sender.checksum_consistent());
        assert!(receiver.checksum_consistent());
        // every constructed pass was walked to the end
        let walked = receiver.peer_checksum_counts();
        assert_eq!(&walked[..receiver.passes()], &receiver.block_counts()[..]);
    }
}

#[test]
fn equal_keys_reconcile_without_flips() {
    let sample = (Key::ones(SAMPLE_LEN), Key::ones(SAMPLE_LEN));
    let working = (Key::ones(256), Key::ones(256));
    let mut pair = pair_with(|a, b| KeyPool::new(a, b, [sample, working])).unwrap();
    pair.reconcile(256).unwrap();
    pair.assert_settled();
    assert_eq!(pair.receiver.borrow().key(), Some(&Key::ones(256)));
    assert!(pair.sender.borrow().flips().is_empty());
    assert!(pair.receiver.borrow().flips().is_empty());
}

#[test]
fn single_bit_error_is_located_and_flipped() {
    let sample = (Key::ones(SAMPLE_LEN), Key::ones(SAMPLE_LEN));
    let working = (Key::ones(256), Key::ones(256).flipped_at(&[17]));
    let mut pair = pair_with(|a, b| KeyPool::new(a, b, [sample, working])).unwrap();
    pair.reconcile(256).unwrap();
    pair.assert_settled();
    assert_eq!(pair.receiver.borrow().key(), Some(&Key::ones(256)));
    assert_eq!(pair.receiver.borrow().flips().to_vec(), vec![17]);
    assert!(pair.sender.borrow().flips().is_empty());
}

#[test]
fn five_percent_errors_converge_across_seeds() {
    let keylen = 10_000;
    let mut successes = 0;
    for seed in 0..100 {
        let mut pair = pair_with(|a, b| NoisySource::new(a, b, 0.05)).unwrap();
        pair.timeline.seed(seed);
        pair.reconcile(keylen).unwrap();
        let (sender, receiver) = (pair.sender.borrow(), pair.receiver.borrow());
        assert!(receiver.checksum_consistent());
        assert_eq!(receiver.passes(), 4);
        if sender.key() == receiver.key() {
            // every flip repaired one real difference of the 5% injected
            assert_eq!(receiver.flips().len(), keylen / 20);
            successes += 1
        }
    }
    assert!(successes >= 95, "only {successes}/100 runs fully reconciled");
}

#[test]
fn already_equal_long_keys_walk_all_passes_idle() {
    let mut pair = pair_with(|a, b| NoisySource::new(a, b, 0.0)).unwrap();
    pair.reconcile(10_000).unwrap();
    pair.assert_settled();
    assert!(pair.receiver.borrow().flips().is_empty());
    // the clamped error-rate floor keeps the block size finite but huge:
    // pass 1 splits the key into two blocks, pass 2 covers it whole
    assert_eq!(pair.receiver.borrow().block_counts(), vec![2, 1]);
}

/// Delegates to the wrapped receiver, then re-checks the parity invariant
/// after every single event it handles.
struct ParityChecked(Rc<RefCell<Cascade>>);

impl Entity<Message> for ParityChecked {
    fn init(&mut self, ctx: &mut Context<'_, Message>) -> anyhow::Result<()> {
        self.0.init(ctx)
    }

    fn on_event(&mut self, event: Message, ctx: &mut Context<'_, Message>) -> anyhow::Result<()> {
        self.0.on_event(event, ctx)?;
        anyhow::ensure!(
            self.0.borrow().checksum_consistent(),
            "checksum table diverged from the key"
        );
        Ok(())
    }
}

#[test]
fn parity_invariant_holds_after_every_event() {
    let mut timeline = Timeline::new();
    let sender_id = timeline.register("alice.cascade").unwrap();
    let receiver_id = timeline.register("bob.cascade").unwrap();
    let oracle_id = timeline.register("bb84").unwrap();
    let sender = Rc::new(RefCell::new(Cascade::new(Role::Sender, oracle_id)));
    let receiver = Rc::new(RefCell::new(Cascade::new(Role::Receiver, oracle_id)));
    ClassicalChannel::new(DELAY, sender_id, receiver_id)
        .wire(&mut sender.borrow_mut(), &mut receiver.borrow_mut());
    timeline.install(sender_id, sender.clone()).unwrap();
    timeline
        .install(receiver_id, ParityChecked(receiver.clone()))
        .unwrap();
    timeline
        .install(oracle_id, NoisySource::new(sender_id, receiver_id, 0.05))
        .unwrap();
    timeline.init().unwrap();
    timeline.seed(42);
    timeline
        .schedule(0, sender_id, CascadeMsg::GenerateKey { keylen: 1_000 })
        .unwrap();
    timeline.run().unwrap();
    assert!(receiver.borrow().finished());
}

#[test]
fn out_of_order_checksum_is_fatal() {
    let sample = (Key::ones(SAMPLE_LEN), Key::ones(SAMPLE_LEN));
    let working = (Key::ones(256), Key::ones(256));
    let mut pair = pair_with(|a, b| KeyPool::new(a, b, [sample, working])).unwrap();
    // a checksum for a block the receiver never asked about, injected while
    // the exchange is still in flight
    pair.timeline
        .schedule(
            22,
            pair.receiver_id,
            CascadeMsg::ReceiveChecksum {
                pass: 2,
                block: 5,
                checksum: false,
            },
        )
        .unwrap();
    let result = pair.reconcile(256);
    assert!(result.is_err());
}

#[test]
fn reports_carry_timing_and_rate() {
    let keylen = 10_000;
    let mut pair = pair_with(|a, b| NoisySource::new(a, b, 0.05)).unwrap();
    pair.timeline.seed(7);
    pair.reconcile(keylen).unwrap();
    let report = pair.sender.borrow().report();
    assert_eq!(report.measured_error_rate, Some(0.05));
    assert!(report.setup_time.is_some());
    assert!(report.start_time >= report.setup_time);
    assert!(report.end_time >= report.start_time);
    let receiver_report = pair.receiver.borrow().report();
    assert_eq!(receiver_report.k, report.k);
    assert!(receiver_report.throughput.unwrap() > 0.0);
    assert_eq!(receiver_report.flipped_bits, pair.receiver.borrow().flips().len());
}
