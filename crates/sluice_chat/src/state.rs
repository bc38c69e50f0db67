use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use sluice_protocol::last_seen::{AckBitSet, LastSeenMessages, WINDOW_SIZE};

use crate::error::ChatViolation;

/// Once this many acknowledgements have been withheld beyond the headroom,
/// the surplus is forwarded out of band.
pub(crate) const MIN_DELAYED_ACK_COUNT: i32 = WINDOW_SIZE as i32;

/// Tracks the last Secure Chat state received from the client.
///
/// The proxy needs a last-seen snapshot that stays consistent with whatever
/// the client signs next, because it is reused to construct synthesized
/// command packets:
///
/// - After forwarding a client chat or command packet, the bitmap from that
///   packet is a known-good last-seen state.
/// - After forwarding a bare acknowledgement, it is not: the proxy cannot
///   know which messages the client actually saw. Acknowledgement packets
///   are therefore withheld, counted in `delayed_ack_count`, and expressed
///   later as an offset on the next signed packet.
/// - The server bounds how many messages may sit unacknowledged, so once the
///   client's window has moved [`WINDOW_SIZE`] past the cached bitmap the
///   surplus is forwarded anyway and the bitmap is replaced by an all-zero
///   dummy the server will never check again.
pub struct ChatState {
    last_timestamp: SystemTime,
    acknowledged: AckBitSet,
    /// Shared with the owning queue so diagnostics can sample it off-task;
    /// tasks are the only writers.
    delayed_ack_count: Arc<AtomicI32>,
}

/// Outcome of folding a client chat or command packet into the state.
pub(crate) struct MessageUpdate {
    /// The last-seen snapshot to embed in the outbound packet, with any
    /// withheld acknowledgements baked into its offset. `None` when the
    /// client sent none.
    pub last_seen: Option<LastSeenMessages>,
    pub violation: Option<ChatViolation>,
}

impl ChatState {
    pub(crate) fn new() -> Self {
        Self {
            last_timestamp: SystemTime::UNIX_EPOCH,
            acknowledged: AckBitSet::default(),
            delayed_ack_count: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Timestamp of the most recently forwarded client chat or command. The
    /// client is the source of truth; monotonicity is not enforced.
    pub fn last_timestamp(&self) -> SystemTime {
        self.last_timestamp
    }

    /// The cached acknowledgement bitmap: the last one received from the
    /// client, or the all-zero dummy.
    pub fn acknowledged(&self) -> AckBitSet {
        self.acknowledged
    }

    /// Number of acknowledgements currently withheld from the server.
    pub fn delayed_ack_count(&self) -> i32 {
        self.delayed_ack_count.load(Ordering::Acquire)
    }

    /// A last-seen snapshot for proxy-synthesized packets that were not
    /// triggered by a fresh client packet.
    pub fn create_last_seen(&self) -> LastSeenMessages {
        LastSeenMessages::new(0, self.acknowledged)
    }

    pub(crate) fn delayed_handle(&self) -> Arc<AtomicI32> {
        self.delayed_ack_count.clone()
    }

    /// Folds a client chat or command packet into the state.
    ///
    /// A fresh signed last-seen means any withheld acknowledgements must be
    /// expressed to the server now; they are baked into the returned
    /// snapshot's offset rather than sent as a separate acknowledgement
    /// packet, keeping the signed payload that follows verifiable.
    pub(crate) fn update_from_message(
        &mut self,
        timestamp: Option<SystemTime>,
        last_seen: Option<LastSeenMessages>,
    ) -> MessageUpdate {
        if let Some(timestamp) = timestamp {
            self.last_timestamp = timestamp;
        }

        let Some(last_seen) = last_seen else {
            return MessageUpdate {
                last_seen: None,
                violation: None,
            };
        };

        let delayed = self.delayed_ack_count.swap(0, Ordering::AcqRel);
        self.acknowledged = last_seen.acknowledged();

        match last_seen.shifted_by(delayed) {
            Some(shifted) => MessageUpdate {
                last_seen: Some(shifted),
                violation: None,
            },
            None => MessageUpdate {
                // Clamp so the packet can still be written; the supervisor
                // hears about the overflow.
                last_seen: Some(LastSeenMessages::new(i32::MAX, last_seen.acknowledged())),
                violation: Some(ChatViolation::AckOffsetOverflow {
                    offset: last_seen.offset(),
                    delta: delayed,
                }),
            },
        }
    }

    /// Adds `count` to the withheld-acknowledgement accumulator and returns
    /// the number of acknowledgements that must be forwarded to the server
    /// now, or 0 while they can all stay withheld.
    ///
    /// `count` has already been validated non-negative; a negative
    /// accumulator is corrupted bookkeeping.
    pub(crate) fn accumulate_ack(&mut self, count: i32) -> Result<i32, ChatViolation> {
        let delayed = self
            .delayed_ack_count
            .fetch_add(count, Ordering::AcqRel)
            .wrapping_add(count);
        if delayed < 0 {
            return Err(ChatViolation::DelayedAckUnderflow {
                count: delayed,
                task: "acknowledgement",
            });
        }

        let forward = delayed - MIN_DELAYED_ACK_COUNT;
        if forward >= WINDOW_SIZE as i32 {
            // The client's window has moved past the cached bitmap; the
            // server will never check those bits again, so the dummy stands
            // in and the bitmap needs no shifting.
            self.acknowledged = AckBitSet::default();
            self.delayed_ack_count
                .store(MIN_DELAYED_ACK_COUNT, Ordering::Release);
            Ok(forward)
        } else {
            Ok(0)
        }
    }
}
