use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use sluice_protocol::packets::MessageAcknowledgmentC2s;
use sluice_protocol::{LastSeenMessages, Packet, VarInt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::ChatViolation;
use crate::link::Player;
use crate::state::ChatState;

// Tasks are type-erased so one ordered stream can carry every packet kind.
type BoxedPacket = Box<dyn Packet + Send>;
type PacketFuture = Pin<Box<dyn Future<Output = anyhow::Result<BoxedPacket>> + Send>>;
type BuildFn = Box<dyn FnOnce(Option<LastSeenMessages>) -> PacketFuture + Send>;
type SynthesizeFn = Box<dyn FnOnce(&ChatState) -> BoxedPacket + Send>;

enum Task {
    ClientPacket {
        build: BuildFn,
        timestamp: Option<SystemTime>,
        last_seen: Option<LastSeenMessages>,
    },
    Synthesized {
        synthesize: SynthesizeFn,
    },
    Acknowledgement {
        offset: i32,
    },
}

/// A precisely ordered per-player queue for chat, command, and
/// acknowledgement traffic toward the backend server.
///
/// Tasks run strictly one at a time in enqueue order on a dedicated worker;
/// a task's state update and write complete before the next task starts.
/// Enqueueing never blocks. Failing tasks drop their packet and the chain
/// moves on: a lost packet is recoverable, a reordered or stalled stream is
/// not.
pub struct ChatQueue {
    tasks: mpsc::UnboundedSender<Task>,
    delayed_acks: Arc<AtomicI32>,
}

impl ChatQueue {
    /// Creates the queue for `player` and spawns its worker. Contract
    /// breaches found while processing tasks are reported on `violations`.
    ///
    /// Dropping the queue lets the worker finish whatever is already
    /// enqueued and exit; nothing awaits it.
    pub fn new(player: Arc<dyn Player>, violations: flume::Sender<ChatViolation>) -> Self {
        let (tasks, receiver) = mpsc::unbounded_channel();
        let state = ChatState::new();
        let delayed_acks = state.delayed_handle();

        tokio::spawn(run_worker(receiver, state, player, violations));

        Self {
            tasks,
            delayed_acks,
        }
    }

    /// Queues a chat or command packet sent by the player.
    ///
    /// When the task reaches the head of the queue, the chat state is
    /// updated from `timestamp` and `last_seen` first, then `build` is
    /// invoked with the effective last-seen snapshot to embed (`None` when
    /// the client sent none) and the packet it yields is written to the
    /// player's current backend. A failing build drops the packet but keeps
    /// the state update.
    pub fn enqueue_client_packet<F, Fut, P>(
        &self,
        build: F,
        timestamp: Option<SystemTime>,
        last_seen: Option<LastSeenMessages>,
    ) where
        F: FnOnce(Option<LastSeenMessages>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<P>> + Send + 'static,
        P: Packet + Send + 'static,
    {
        let build: BuildFn = Box::new(move |last_seen| {
            let fut = build(last_seen);
            let fut: PacketFuture =
                Box::pin(async move { fut.await.map(|packet| Box::new(packet) as BoxedPacket) });
            fut
        });

        self.enqueue(Task::ClientPacket {
            build,
            timestamp,
            last_seen,
        });
    }

    /// Queues a proxy-synthesized packet, constructed from the chat state as
    /// of the moment every earlier task has completed. The state is not
    /// mutated.
    pub fn enqueue_synthesized<F, P>(&self, synthesize: F)
    where
        F: FnOnce(&ChatState) -> P + Send + 'static,
        P: Packet + Send + 'static,
    {
        self.enqueue(Task::Synthesized {
            synthesize: Box::new(move |state| Box::new(synthesize(state)) as BoxedPacket),
        });
    }

    /// Queues a client acknowledgement of `offset` messages. Withheld until
    /// forwarding becomes unavoidable, at which point a single
    /// acknowledgement packet carries the surplus.
    pub fn enqueue_acknowledgement(&self, offset: i32) {
        self.enqueue(Task::Acknowledgement { offset });
    }

    /// Number of acknowledgements currently withheld from the server.
    /// Diagnostic; safe to call from any thread.
    pub fn delayed_ack_count(&self) -> i32 {
        self.delayed_acks.load(Ordering::Acquire)
    }

    fn enqueue(&self, task: Task) {
        // The only way the worker is gone is player teardown, where dropping
        // the task is exactly the no-op the contract asks for.
        let _ = self.tasks.send(task);
    }
}

async fn run_worker(
    mut tasks: mpsc::UnboundedReceiver<Task>,
    mut state: ChatState,
    player: Arc<dyn Player>,
    violations: flume::Sender<ChatViolation>,
) {
    while let Some(task) = tasks.recv().await {
        run_task(task, &mut state, &*player, &violations).await;
    }
}

async fn run_task(
    task: Task,
    state: &mut ChatState,
    player: &dyn Player,
    violations: &flume::Sender<ChatViolation>,
) {
    match task {
        Task::ClientPacket {
            build,
            timestamp,
            last_seen,
        } => {
            // State commits before the build is awaited: a failed build must
            // not roll back the acknowledgement carry.
            let update = state.update_from_message(timestamp, last_seen);
            if let Some(violation) = update.violation {
                report(violations, violation);
            }

            match build(update.last_seen).await {
                Ok(packet) => write_packet(&*packet, player).await,
                Err(e) => debug!("dropping client packet: {e:#}"),
            }
        }
        Task::Synthesized { synthesize } => {
            let packet = synthesize(state);
            write_packet(&*packet, player).await;
        }
        Task::Acknowledgement { offset } => {
            if offset < 0 {
                report(violations, ChatViolation::NegativeAckCount { count: offset });
                return;
            }

            match state.accumulate_ack(offset) {
                Ok(0) => {}
                Ok(forward) => {
                    let packet = MessageAcknowledgmentC2s {
                        message_count: VarInt(forward),
                    };
                    write_packet(&packet, player).await;
                }
                Err(violation) => report(violations, violation),
            }
        }
    }
}

async fn write_packet(packet: &dyn Packet, player: &dyn Player) {
    let Some(link) = player.current_server() else {
        debug!(
            packet = packet.packet_name(),
            "player has no backend link; dropping packet"
        );
        return;
    };

    if let Err(e) = link.write(packet).await {
        debug!(packet = packet.packet_name(), "backend write failed: {e:#}");
    }
}

fn report(violations: &flume::Sender<ChatViolation>, violation: ChatViolation) {
    if violation.is_fatal() {
        error!("chat queue invariant violated: {violation}");
    } else {
        warn!("chat protocol violation: {violation}");
    }

    let _ = violations.send(violation);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use sluice_protocol::frame;
    use sluice_protocol::last_seen::AckBitSet;
    use sluice_protocol::packets::{id, ChatMessageC2s};
    use sluice_protocol::Decode;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    use super::*;
    use crate::link::ServerLink;

    struct TestPlayer {
        link: Mutex<Option<ServerLink>>,
    }

    impl TestPlayer {
        fn disconnected() -> Arc<Self> {
            Arc::new(Self {
                link: Mutex::new(None),
            })
        }

        fn connected() -> (Arc<Self>, DuplexStream) {
            let player = Self::disconnected();
            let peer = player.connect();
            (player, peer)
        }

        /// Swaps in a fresh backend link, as a server switch would.
        fn connect(&self) -> DuplexStream {
            let (io, peer) = tokio::io::duplex(4096);
            let (link, _task) = ServerLink::spawn(io);
            *self.link.lock().unwrap() = Some(link);
            peer
        }
    }

    impl Player for TestPlayer {
        fn current_server(&self) -> Option<ServerLink> {
            self.link.lock().unwrap().clone()
        }
    }

    fn new_queue(player: Arc<TestPlayer>) -> (ChatQueue, flume::Receiver<ChatViolation>) {
        let (sender, receiver) = flume::unbounded();
        (ChatQueue::new(player, sender), receiver)
    }

    fn bits(idxs: &[usize]) -> AckBitSet {
        let mut set = AckBitSet::default();
        for &i in idxs {
            set.set_bit(i, true);
        }
        set
    }

    fn ts(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn chat(message: &str, last_seen: Option<LastSeenMessages>) -> ChatMessageC2s {
        ChatMessageC2s {
            message: message.into(),
            timestamp: 0,
            salt: 0,
            signature: None,
            last_seen: last_seen
                .unwrap_or_else(|| LastSeenMessages::new(0, AckBitSet::default())),
        }
    }

    /// Reads from `peer` until `n` complete frames have arrived.
    async fn read_frames(peer: &mut DuplexStream, n: usize) -> Vec<(i32, Vec<u8>)> {
        timeout(Duration::from_secs(5), async {
            let mut buf = vec![];
            loop {
                let mut r = &buf[..];
                let mut frames = vec![];
                while let Some((packet_id, body)) = frame::split_frame(&mut r).unwrap() {
                    frames.push((packet_id, body.to_vec()));
                }
                if frames.len() >= n {
                    return frames;
                }

                let mut chunk = [0; 512];
                let count = peer.read(&mut chunk).await.unwrap();
                assert!(count > 0, "link closed before {n} frames arrived");
                buf.extend_from_slice(&chunk[..count]);
            }
        })
        .await
        .expect("timed out waiting for frames")
    }

    /// Resolves once every task enqueued before it has fully completed. The
    /// barrier task itself fails its build, so it never touches the link.
    async fn barrier(queue: &ChatQueue) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        queue.enqueue_client_packet(
            move |_ls| async move {
                let _ = tx.send(());
                Err::<ChatMessageC2s, _>(anyhow::anyhow!("barrier"))
            },
            None,
            None,
        );
        rx.await.unwrap();
    }

    fn decode_chat(frame: &(i32, Vec<u8>)) -> ChatMessageC2s {
        assert_eq!(frame.0, id::CHAT_MESSAGE_C2S);
        ChatMessageC2s::decode(&mut frame.1.as_slice()).unwrap()
    }

    fn decode_ack(frame: &(i32, Vec<u8>)) -> i32 {
        assert_eq!(frame.0, id::MESSAGE_ACKNOWLEDGMENT_C2S);
        MessageAcknowledgmentC2s::decode(&mut frame.1.as_slice())
            .unwrap()
            .message_count
            .0
    }

    #[tokio::test]
    async fn forwards_chat_with_client_last_seen() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, _violations) = new_queue(player);

        let last_seen = LastSeenMessages::new(0, bits(&[3, 5]));
        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("hello", ls)) },
            Some(ts(1)),
            Some(last_seen),
        );

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(decode_chat(&frames[0]).last_seen, last_seen);
        assert_eq!(queue.delayed_ack_count(), 0);
    }

    #[tokio::test]
    async fn acks_are_absorbed_into_the_next_message_offset() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, _violations) = new_queue(player);

        queue.enqueue_acknowledgement(5);
        queue.enqueue_acknowledgement(10);
        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("after acks", ls)) },
            None,
            Some(LastSeenMessages::new(0, bits(&[7]))),
        );

        // The two acknowledgement tasks precede the chat in the stream, so
        // the first frame being the chat proves they wrote nothing.
        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(
            decode_chat(&frames[0]).last_seen,
            LastSeenMessages::new(15, bits(&[7]))
        );
        assert_eq!(queue.delayed_ack_count(), 0);
    }

    #[tokio::test]
    async fn ack_overflow_is_forwarded_out_of_band() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, _violations) = new_queue(player);

        queue.enqueue_acknowledgement(45);

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(decode_ack(&frames[0]), 25);
        assert_eq!(queue.delayed_ack_count(), 20);
    }

    #[tokio::test]
    async fn tasks_stay_ordered_across_slow_builds() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, _violations) = new_queue(player);

        queue.enqueue_client_packet(
            move |ls| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(chat("slow", ls))
            },
            None,
            None,
        );
        queue.enqueue_client_packet(move |ls| async move { Ok(chat("fast", ls)) }, None, None);

        let frames = read_frames(&mut peer, 2).await;
        assert_eq!(decode_chat(&frames[0]).message, "slow");
        assert_eq!(decode_chat(&frames[1]).message, "fast");
    }

    #[tokio::test]
    async fn synthesized_packets_keep_their_place_and_see_prior_state() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, _violations) = new_queue(player);

        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("one", ls)) },
            None,
            Some(LastSeenMessages::new(0, bits(&[2]))),
        );
        queue.enqueue_synthesized(|state| chat("synthesized", Some(state.create_last_seen())));
        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("two", ls)) },
            None,
            Some(LastSeenMessages::new(0, bits(&[9]))),
        );

        let frames = read_frames(&mut peer, 3).await;
        assert_eq!(decode_chat(&frames[0]).message, "one");

        let synthesized = decode_chat(&frames[1]);
        assert_eq!(synthesized.message, "synthesized");
        assert_eq!(
            synthesized.last_seen,
            LastSeenMessages::new(0, bits(&[2]))
        );

        assert_eq!(
            decode_chat(&frames[2]).last_seen,
            LastSeenMessages::new(0, bits(&[9]))
        );
    }

    #[tokio::test]
    async fn closed_or_missing_link_drops_packets_but_not_the_queue() {
        let player = TestPlayer::disconnected();
        let (queue, _violations) = new_queue(player.clone());

        // No backend at all.
        queue.enqueue_client_packet(move |ls| async move { Ok(chat("lost", ls)) }, None, None);
        barrier(&queue).await;

        // A backend that is already closed.
        let mut dead_peer = player.connect();
        player.current_server().unwrap().close();
        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("also lost", ls)) },
            None,
            None,
        );
        barrier(&queue).await;

        // A later server switch; the queue must still be live, and only the
        // packet enqueued after the switch reaches the new backend.
        let mut peer = player.connect();
        queue.enqueue_client_packet(
            move |ls| async move { Ok(chat("delivered", ls)) },
            None,
            None,
        );

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(decode_chat(&frames[0]).message, "delivered");

        drop(player);
        let mut rest = vec![];
        dead_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn failed_build_keeps_state_and_chain() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, violations) = new_queue(player);

        queue.enqueue_acknowledgement(5);
        queue.enqueue_client_packet(
            move |_ls| async move {
                Err::<ChatMessageC2s, _>(anyhow::anyhow!("serializer failed"))
            },
            Some(ts(9)),
            Some(LastSeenMessages::new(0, bits(&[7]))),
        );
        // The failed task already consumed the acknowledgement carry and
        // cached the bitmap; the synthesized packet observes both.
        queue.enqueue_synthesized(|state| chat("probe", Some(state.create_last_seen())));

        let frames = read_frames(&mut peer, 1).await;
        let probe = decode_chat(&frames[0]);
        assert_eq!(probe.message, "probe");
        assert_eq!(probe.last_seen, LastSeenMessages::new(0, bits(&[7])));
        assert_eq!(queue.delayed_ack_count(), 0);
        assert!(violations.try_recv().is_err());
    }

    #[tokio::test]
    async fn negative_ack_count_is_reported_and_skipped() {
        let (player, mut peer) = TestPlayer::connected();
        let (queue, violations) = new_queue(player);

        queue.enqueue_acknowledgement(-1);
        queue.enqueue_acknowledgement(45);

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(decode_ack(&frames[0]), 25);
        assert_eq!(
            violations.recv_async().await.unwrap(),
            ChatViolation::NegativeAckCount { count: -1 }
        );
    }
}
