//! Discrete-event simulation kernel for quantum-network protocols, plus the
//! Cascade information-reconciliation protocol running on top of it.
//!
//! The kernel ([`event`], [`timeline`]) is generic over the message type it
//! delivers: entities expose per-entity message enums and the simulation
//! composes them into one union ([`Message`]) with `From`/`TryInto`
//! conversions, so the scheduler never learns about concrete entity types.

pub mod bb84;
pub mod cascade;
pub mod channel;
pub mod event;
pub mod key;
pub mod timeline;

use derive_more::{From, TryInto};
use serde::{Deserialize, Serialize};

use crate::{bb84::Bb84Msg, cascade::CascadeMsg};

/// Message union of the stock simulation: one variant per entity message set.
#[derive(Debug, Clone, Serialize, Deserialize, From, TryInto)]
pub enum Message {
    Cascade(CascadeMsg),
    Bb84(Bb84Msg),
}
