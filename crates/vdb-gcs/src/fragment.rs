//! Action fragmentation and reassembly.
//!
//! Actions larger than one transport message are split into [`Fragment`]s
//! and reassembled per `(source, tag)` on delivery. Fragments of one action
//! travel through the same totally ordered stream, so a correct sender's
//! fragments always arrive in order; anything else means the action was
//! torn (for example by a view change) and the partial data is discarded.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{ActionType, MemberId};

/// Upper bound on the framing and encoding overhead of one fragment
/// message, in bytes.
///
/// A bincode-encoded `MessagePayload::Action` costs 29 bytes plus the data,
/// and the frame header adds 8 more. The bound leaves headroom for future
/// fields.
pub const FRAGMENT_OVERHEAD: usize = 64;

/// Returns how many data bytes fit into one fragment for a packet size.
pub fn max_fragment_data(pkt_size: usize) -> usize {
    pkt_size.saturating_sub(FRAGMENT_OVERHEAD).max(1)
}

// ============================================================================
// Fragment
// ============================================================================

/// One piece of an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Sender-local identifier of the action.
    pub tag: u64,

    /// Type of the whole action.
    pub act_type: ActionType,

    /// Position of this fragment within the action, from zero.
    pub frag_no: u32,

    /// True for the final fragment of the action.
    pub last: bool,

    /// Fragment data.
    pub data: Vec<u8>,
}

/// Splits an action into fragments whose encoded messages fit `pkt_size`.
///
/// An empty action still produces one (empty, final) fragment.
pub fn split(tag: u64, act_type: ActionType, data: &[u8], pkt_size: usize) -> Vec<Fragment> {
    let chunk = max_fragment_data(pkt_size);

    if data.is_empty() {
        return vec![Fragment {
            tag,
            act_type,
            frag_no: 0,
            last: true,
            data: Vec::new(),
        }];
    }

    let count = data.len().div_ceil(chunk);
    data.chunks(chunk)
        .enumerate()
        .map(|(i, piece)| Fragment {
            tag,
            act_type,
            frag_no: i as u32,
            last: i + 1 == count,
            data: piece.to_vec(),
        })
        .collect()
}

// ============================================================================
// Reassembler
// ============================================================================

/// A completely reassembled action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembled {
    /// Sender-local identifier of the action.
    pub tag: u64,

    /// Action type.
    pub act_type: ActionType,

    /// Action payload.
    pub data: Bytes,
}

#[derive(Debug)]
struct Partial {
    act_type: ActionType,
    next_frag: u32,
    data: BytesMut,
}

/// Reassembles fragments into actions, per source and tag.
#[derive(Debug, Default)]
pub struct Reassembler {
    partials: HashMap<(MemberId, u64), Partial>,
}

impl Reassembler {
    /// Creates an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of incomplete actions being buffered.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Feeds one fragment from `source`.
    ///
    /// Returns the action once its final fragment arrives. An unexpected
    /// fragment number discards whatever was buffered for that action.
    pub fn push(&mut self, source: &MemberId, fragment: Fragment) -> Option<Reassembled> {
        let key = (source.clone(), fragment.tag);

        if fragment.frag_no == 0 {
            if self.partials.remove(&key).is_some() {
                tracing::warn!(
                    member = %source,
                    tag = fragment.tag,
                    "action restarted before completion, dropping partial data"
                );
            }
            if fragment.last {
                return Some(Reassembled {
                    tag: fragment.tag,
                    act_type: fragment.act_type,
                    data: Bytes::from(fragment.data),
                });
            }
            let mut data = BytesMut::with_capacity(fragment.data.len() * 2);
            data.extend_from_slice(&fragment.data);
            self.partials.insert(
                key,
                Partial {
                    act_type: fragment.act_type,
                    next_frag: 1,
                    data,
                },
            );
            return None;
        }

        let Some(partial) = self.partials.get_mut(&key) else {
            tracing::debug!(
                member = %source,
                tag = fragment.tag,
                frag_no = fragment.frag_no,
                "dropping fragment of unknown action"
            );
            return None;
        };

        if partial.next_frag != fragment.frag_no || partial.act_type != fragment.act_type {
            tracing::warn!(
                member = %source,
                tag = fragment.tag,
                expected = partial.next_frag,
                got = fragment.frag_no,
                "out-of-sequence fragment, discarding torn action"
            );
            self.partials.remove(&key);
            return None;
        }

        partial.data.extend_from_slice(&fragment.data);
        partial.next_frag += 1;

        if !fragment.last {
            return None;
        }

        let partial = self.partials.remove(&key)?;
        Some(Reassembled {
            tag: fragment.tag,
            act_type: partial.act_type,
            data: partial.data.freeze(),
        })
    }

    /// Discards partial actions of every source not in `members`.
    pub fn retain_members(&mut self, members: &[MemberId]) {
        let before = self.partials.len();
        self.partials
            .retain(|(source, _), _| members.contains(source));
        let dropped = before - self.partials.len();
        if dropped > 0 {
            tracing::debug!(dropped, "discarded partial actions of departed members");
        }
    }
}
