//! Stand-ins for the BB84 key layer.
//!
//! The real quantum layer is an external collaborator; Cascade only relies on
//! the contract that a `GenerateKey { keylen }` request eventually delivers a
//! `keylen`-bit key to *both* parties, the two copies possibly disagreeing in
//! some positions. [`KeyPool`] replays preset key pairs, [`NoisySource`]
//! draws fresh keys and pushes one copy through a symmetric binary channel.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cascade::CascadeMsg,
    event::{EntityId, Time},
    key::Key,
    timeline::{Context, Entity},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Bb84Msg {
    GenerateKey { keylen: usize },
}

/// Oracle that hands out preset key pairs, one pair per request, in order.
#[derive(Debug)]
pub struct KeyPool {
    end_1: EntityId,
    end_2: EntityId,
    keys: VecDeque<(Key, Key)>,
    latency: Time,
}

impl KeyPool {
    pub fn new(
        end_1: EntityId,
        end_2: EntityId,
        keys: impl IntoIterator<Item = (Key, Key)>,
    ) -> Self {
        Self {
            end_1,
            end_2,
            keys: keys.into_iter().collect(),
            latency: 0,
        }
    }

    pub fn with_latency(mut self, latency: Time) -> Self {
        self.latency = latency;
        self
    }

    fn deliver<M: From<CascadeMsg>>(
        &mut self,
        keylen: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        let (key_1, key_2) = self
            .keys
            .pop_front()
            .ok_or(anyhow::anyhow!("key pool exhausted"))?;
        anyhow::ensure!(
            key_1.len() == keylen && key_2.len() == keylen,
            "pooled key pair is {}/{} bits, request asked for {keylen}",
            key_1.len(),
            key_2.len()
        );
        debug!(entity = ctx.name(), keylen, "deliver pooled key pair");
        ctx.schedule(self.latency, self.end_1, CascadeMsg::KeyFromBb84 { key: key_1 })?;
        ctx.schedule(self.latency, self.end_2, CascadeMsg::KeyFromBb84 { key: key_2 })?;
        Ok(())
    }
}

impl<M> Entity<M> for KeyPool
where
    M: From<CascadeMsg> + TryInto<Bb84Msg>,
    <M as TryInto<Bb84Msg>>::Error: std::fmt::Display,
{
    fn on_event(&mut self, event: M, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        let Bb84Msg::GenerateKey { keylen } = event
            .try_into()
            .map_err(|err| anyhow::anyhow!("not an oracle message: {err}"))?;
        self.deliver(keylen, ctx)
    }
}

/// Oracle that draws a fresh random key per request and flips a fixed share
/// of the second party's copy, rounding `error_rate * keylen` to a count of
/// distinct positions.
#[derive(Debug)]
pub struct NoisySource {
    end_1: EntityId,
    end_2: EntityId,
    error_rate: f64,
    latency: Time,
}

impl NoisySource {
    pub fn new(end_1: EntityId, end_2: EntityId, error_rate: f64) -> Self {
        Self {
            end_1,
            end_2,
            error_rate,
            latency: 0,
        }
    }

    pub fn with_latency(mut self, latency: Time) -> Self {
        self.latency = latency;
        self
    }

    fn deliver<M: From<CascadeMsg>>(
        &mut self,
        keylen: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        let flips = (self.error_rate * keylen as f64).round() as usize;
        let key_1 = Key::random(ctx.rng(), keylen);
        let positions = rand::seq::index::sample(ctx.rng(), keylen, flips).into_vec();
        let key_2 = key_1.flipped_at(&positions);
        debug!(entity = ctx.name(), keylen, flips, "deliver noisy key pair");
        ctx.schedule(self.latency, self.end_1, CascadeMsg::KeyFromBb84 { key: key_1 })?;
        ctx.schedule(self.latency, self.end_2, CascadeMsg::KeyFromBb84 { key: key_2 })?;
        Ok(())
    }
}

impl<M> Entity<M> for NoisySource
where
    M: From<CascadeMsg> + TryInto<Bb84Msg>,
    <M as TryInto<Bb84Msg>>::Error: std::fmt::Display,
{
    fn init(&mut self, _: &mut Context<'_, M>) -> anyhow::Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.error_rate),
            "error rate {} outside [0, 1]",
            self.error_rate
        );
        Ok(())
    }

    fn on_event(&mut self, event: M, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        let Bb84Msg::GenerateKey { keylen } = event
            .try_into()
            .map_err(|err| anyhow::anyhow!("not an oracle message: {err}"))?;
        self.deliver(keylen, ctx)
    }
}
