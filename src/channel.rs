use crate::{
    cascade::{Cascade, Link},
    event::{EntityId, Time},
};

/// Constant-delay classical link between two protocol endpoints.
///
/// Wiring hands each endpoint a typed [`Link`] to its peer up front, so
/// nobody discovers the other side by comparing names at run time. Sending
/// over the channel is scheduling an event on the peer at `now + delay`;
/// the constant delay plus the event list's insertion-order tie-break makes
/// delivery between a fixed pair FIFO.
#[derive(Debug, Clone, Copy)]
pub struct ClassicalChannel {
    pub delay: Time,
    pub end_1: EntityId,
    pub end_2: EntityId,
}

impl ClassicalChannel {
    pub fn new(delay: Time, end_1: EntityId, end_2: EntityId) -> Self {
        Self {
            delay,
            end_1,
            end_2,
        }
    }

    /// Hand both endpoints their view of this channel.
    pub fn wire(&self, end_1: &mut Cascade, end_2: &mut Cascade) {
        end_1.connect(Link {
            peer: self.end_2,
            delay: self.delay,
        });
        end_2.connect(Link {
            peer: self.end_1,
            delay: self.delay,
        });
    }
}
