//! Cascade information reconciliation.
//!
//! Two entities of complementary role share a classical channel with fixed
//! delay. The sender (role 0) owns the reference key and answers parity
//! queries; the receiver (role 1) walks passes of growing block size,
//! binary-searching every block whose parity disagrees and flipping the one
//! bad bit it corners. Flipping a bit to fix pass `p` can expose a stale
//! parity in an earlier pass that contained the same bit, so each flip is
//! followed by a scan of earlier passes before the walk resumes. That
//! back-propagation is the "cascade".
//!
//! Protocol states are pass indices: 0 while the parties agree on an error
//! rate estimate and the initial block size `k`, then 1..=w for the passes,
//! then one past the last constructed pass once reconciliation is over.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bb84::Bb84Msg,
    event::{EntityId, Time},
    key::Key,
    timeline::{Context, Entity},
};

/// Bits in the throwaway key used to estimate the channel error rate.
pub const SAMPLE_LEN: usize = 10_000;

/// Default number of passes (`w`).
pub const DEFAULT_PASSES: usize = 4;

/// Floor for the measured error rate. A zero estimate would send the block
/// size search to infinity.
const MIN_ERROR_RATE: f64 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CascadeMsg {
    /// Ask the sender to obtain a fresh key of `keylen` bits from its oracle.
    GenerateKey { keylen: usize },
    /// Oracle callback delivering a key, possibly noisy relative to the
    /// peer's copy.
    KeyFromBb84 { key: Key },
    /// Receiver's sample key, shipped to the sender for rate estimation.
    ReceiveKey { key: Key },
    /// Block size and working key length, decided by the sender.
    ReceiveParams { k: usize, keylen: usize },
    /// Receiver asks the sender for one block checksum.
    SendChecksum { pass: usize, block: usize },
    /// Sender's checksum for a whole block.
    ReceiveChecksum {
        pass: usize,
        block: usize,
        checksum: bool,
    },
    /// Receiver asks for the parity of a sub-range of a block.
    SendForBinary {
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
    },
    /// Sender's parity over a sub-range of a block.
    ReceiveForBinary {
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
        checksum: bool,
    },
}

/// Endpoint view of the classical channel: the peer and the one-way delay.
#[derive(Debug, Clone, Copy)]
pub struct Link {
    pub peer: EntityId,
    pub delay: Time,
}

/// End-of-run measurements, mirrored from the protocol state.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub role: Role,
    pub keylen: usize,
    pub k: usize,
    pub passes: usize,
    pub measured_error_rate: Option<f64>,
    pub setup_time: Option<Time>,
    pub start_time: Option<Time>,
    pub end_time: Option<Time>,
    /// `end_time - start_time`, picoseconds.
    pub latency: Option<Time>,
    /// Reconciled bits per second of simulated time.
    pub throughput: Option<f64>,
    pub flipped_bits: usize,
}

#[derive(Debug)]
pub struct Cascade {
    role: Role,
    w: usize,
    state: usize,
    keylen: usize,
    key: Option<Key>,
    k: usize,
    // all four tables are 1-indexed by pass, entry 0 is an empty placeholder
    checksum_table: Vec<Vec<bool>>,
    another_checksum: Vec<Vec<bool>>,
    index_to_block_id: Vec<Vec<usize>>,
    block_id_to_index: Vec<Vec<Vec<usize>>>,
    bb84: EntityId,
    link: Option<Link>,

    measured_error_rate: Option<f64>,
    setup_time: Option<Time>,
    start_time: Option<Time>,
    end_time: Option<Time>,
    flips: Vec<usize>,
}

impl Cascade {
    pub fn new(role: Role, bb84: EntityId) -> Self {
        Self {
            role,
            w: DEFAULT_PASSES,
            state: 0,
            keylen: 0,
            key: None,
            k: 0,
            checksum_table: vec![Vec::new()],
            another_checksum: vec![Vec::new()],
            index_to_block_id: vec![Vec::new()],
            block_id_to_index: vec![Vec::new()],
            bb84,
            link: None,
            measured_error_rate: None,
            setup_time: None,
            start_time: None,
            end_time: None,
            flips: Vec::new(),
        }
    }

    pub fn with_passes(mut self, w: usize) -> Self {
        self.w = w;
        self
    }

    /// Attach this endpoint's view of the classical channel.
    pub fn connect(&mut self, link: Link) {
        self.link = Some(link)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> usize {
        self.state
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Number of constructed passes (may be fewer than `w` when blocks would
    /// outgrow the key).
    pub fn passes(&self) -> usize {
        self.checksum_table.len().saturating_sub(1)
    }

    pub fn finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// Bit positions this party flipped, in correction order.
    pub fn flips(&self) -> &[usize] {
        &self.flips
    }

    /// Blocks per constructed pass.
    pub fn block_counts(&self) -> Vec<usize> {
        self.checksum_table.iter().skip(1).map(Vec::len).collect()
    }

    /// Peer checksums banked per pass walked so far.
    pub fn peer_checksum_counts(&self) -> Vec<usize> {
        self.another_checksum.iter().skip(1).map(Vec::len).collect()
    }

    /// Whether every stored block checksum still equals the parity of the
    /// current key over that block.
    pub fn checksum_consistent(&self) -> bool {
        let Some(key) = &self.key else { return true };
        (1..self.checksum_table.len()).all(|pass| {
            self.checksum_table[pass]
                .iter()
                .enumerate()
                .all(|(block, &checksum)| {
                    let len = self.block_id_to_index[pass][block].len();
                    self.block_parity(key, pass, block, 0, len)
                        .map_or(false, |parity| parity == checksum)
                })
        })
    }

    pub fn report(&self) -> Report {
        let latency = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        };
        Report {
            role: self.role,
            keylen: self.keylen,
            k: self.k,
            passes: self.passes(),
            measured_error_rate: self.measured_error_rate,
            setup_time: self.setup_time,
            start_time: self.start_time,
            end_time: self.end_time,
            latency,
            throughput: latency
                .filter(|&latency| latency > 0)
                .map(|latency| self.keylen as f64 / (latency as f64 * 1e-12)),
            flipped_bits: self.flips.len(),
        }
    }

    fn send_to_peer<M: From<CascadeMsg>>(
        &self,
        ctx: &mut Context<'_, M>,
        message: CascadeMsg,
    ) -> anyhow::Result<()> {
        let link = self
            .link
            .ok_or(anyhow::anyhow!("classical channel not wired"))?;
        ctx.schedule(link.delay, link.peer, message)?;
        Ok(())
    }

    fn ask_oracle<M: From<Bb84Msg>>(
        &self,
        keylen: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        ctx.schedule(0, self.bb84, Bb84Msg::GenerateKey { keylen })?;
        Ok(())
    }

    fn generate_key<M: From<Bb84Msg>>(
        &mut self,
        keylen: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(entity = ctx.name(), state = self.state, keylen, "generate_key");
        anyhow::ensure!(
            self.role == Role::Sender,
            "{} is the receiving side, it cannot generate a key",
            ctx.name()
        );
        if self.state == 0 {
            // throwaway sample first, to size the blocks
            self.keylen = keylen;
            self.ask_oracle(SAMPLE_LEN, ctx)
        } else {
            self.ask_oracle(self.keylen, ctx)
        }
    }

    fn key_from_bb84<M: From<CascadeMsg>>(
        &mut self,
        key: Key,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(
            entity = ctx.name(),
            state = self.state,
            keylen = key.len(),
            "key_from_bb84"
        );
        self.key = Some(key);
        if self.state == 1 {
            self.start_time = Some(ctx.now());
            self.create_checksum_table()?
        }
        match (self.state, self.role) {
            (0, Role::Receiver) => self.send_key(ctx),
            (1, Role::Sender) => self.send_checksum(1, 0, ctx),
            _ => Ok(()),
        }
    }

    fn send_key<M: From<CascadeMsg>>(&self, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        let key = self
            .key
            .clone()
            .ok_or(anyhow::anyhow!("no sample key to send"))?;
        self.send_to_peer(ctx, CascadeMsg::ReceiveKey { key })
    }

    /// Sender side: estimate the error rate from the receiver's sample,
    /// derive the pass-1 block size and ship the parameters back.
    fn receive_key<M: From<CascadeMsg>>(
        &mut self,
        key: Key,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        let own = self
            .key
            .as_ref()
            .ok_or(anyhow::anyhow!("sample key not delivered yet"))?;
        anyhow::ensure!(own.len() == key.len(), "sample length mismatch");
        let diff = own.hamming(&key);
        let p = if diff == 0 {
            MIN_ERROR_RATE
        } else {
            diff as f64 / SAMPLE_LEN as f64
        };
        debug!(entity = ctx.name(), diff, p, "receive_key");
        self.measured_error_rate = Some(p);
        self.k = get_k1(p, 0, SAMPLE_LEN);
        self.send_params(ctx)?;
        self.state = 1;
        self.setup_time = Some(ctx.now());
        Ok(())
    }

    fn send_params<M: From<CascadeMsg>>(&self, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        self.send_to_peer(
            ctx,
            CascadeMsg::ReceiveParams {
                k: self.k,
                keylen: self.keylen,
            },
        )
    }

    fn receive_params<M: From<CascadeMsg>>(
        &mut self,
        k: usize,
        keylen: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(entity = ctx.name(), k, keylen, "receive_params");
        anyhow::ensure!(
            self.role == Role::Receiver,
            "{} is the sending side, it cannot take parameters from its peer",
            ctx.name()
        );
        anyhow::ensure!(k > 0, "degenerate pass-1 block size");
        self.k = k;
        self.keylen = keylen;
        self.state = 1;
        self.setup_time = Some(ctx.now());
        self.another_checksum.push(Vec::new());
        // now ask the sender for the working key
        self.send_to_peer(ctx, CascadeMsg::GenerateKey { keylen })
    }

    /// Build `index_to_block_id`, `block_id_to_index` and `checksum_table`
    /// for every pass. Both parties derive identical tables from
    /// `(k, keylen)` alone: pass 1 blocks are contiguous, later passes
    /// shuffle the indices with an RNG seeded by the pass id.
    fn create_checksum_table(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.checksum_table.len() == 1,
            "block tables are built once, at the first working key"
        );
        anyhow::ensure!(self.k > 0 && self.keylen > 0, "tables need k and keylen");
        let key = self
            .key
            .as_ref()
            .ok_or(anyhow::anyhow!("no key to checksum"))?;
        for pass in 1..=self.w {
            let block_size = self.k << (pass - 1);
            // blocks of half this size already covered the whole key, more
            // passes cannot localize anything
            if pass > 1 && block_size / 2 >= self.keylen {
                break;
            }
            let order: Vec<usize> = if pass == 1 {
                (0..self.keylen).collect()
            } else {
                block_permutation(pass, self.keylen)
            };
            let block_num = self.keylen.div_ceil(block_size);
            let index_to_block: Vec<usize> =
                order.iter().map(|position| position / block_size).collect();
            // exact lengths up front: the last block is short, its trailing
            // slots would fall past the key
            let mut block_to_index: Vec<Vec<usize>> = (0..block_num)
                .map(|block| vec![0; block_size.min(self.keylen - block * block_size)])
                .collect();
            // `order` is a permutation of 0..keylen, every slot is written
            for (index, &position) in order.iter().enumerate() {
                block_to_index[position / block_size][position % block_size] = index
            }
            let mut checksums = vec![false; block_num];
            for (index, &block) in index_to_block.iter().enumerate() {
                checksums[block] ^= key.get(index)
            }
            self.index_to_block_id.push(index_to_block);
            self.block_id_to_index.push(block_to_index);
            self.checksum_table.push(checksums);
        }
        debug!(
            k = self.k,
            keylen = self.keylen,
            passes = self.passes(),
            "checksum tables built"
        );
        Ok(())
    }

    /// Sender side: answer one block-checksum request, or retire when the
    /// receiver has walked past the last pass.
    fn send_checksum<M: From<CascadeMsg>>(
        &mut self,
        pass: usize,
        block: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(entity = ctx.name(), pass, block, "send_checksum");
        if pass > self.state {
            self.state += 1
        }
        if self.state >= self.checksum_table.len() {
            self.end_time.get_or_insert(ctx.now());
            return Ok(());
        }
        let checksum = *self
            .checksum_table
            .get(pass)
            .and_then(|checksums| checksums.get(block))
            .ok_or(anyhow::anyhow!(
                "checksum request out of range: pass {pass} block {block}"
            ))?;
        self.send_to_peer(
            ctx,
            CascadeMsg::ReceiveChecksum {
                pass,
                block,
                checksum,
            },
        )
    }

    /// Receiver side: bank the sender's block checksum, then either move on
    /// or open a binary search on the disagreeing block.
    fn receive_checksum<M: From<CascadeMsg>>(
        &mut self,
        pass: usize,
        block: usize,
        checksum: bool,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(entity = ctx.name(), pass, block, checksum, "receive_checksum");
        let current = self.another_checksum.len() - 1;
        let current_complete = self.another_checksum[current].len()
            >= self.checksum_table.get(current).map_or(0, Vec::len);
        let in_order = (pass == current && block == self.another_checksum[current].len())
            || (pass == current + 1 && block == 0 && current_complete);
        anyhow::ensure!(
            in_order,
            "{} received checksum out of order: pass {pass} block {block}",
            ctx.name()
        );
        if pass == current + 1 {
            self.another_checksum.push(Vec::new())
        }
        self.another_checksum[pass].push(checksum);

        let local = *self
            .checksum_table
            .get(pass)
            .and_then(|checksums| checksums.get(block))
            .ok_or(anyhow::anyhow!(
                "checksum for unknown block: pass {pass} block {block}"
            ))?;
        if local == checksum {
            self.request_next_checksum(ctx)
        } else {
            let block_size = self.block_id_to_index[pass][block].len();
            self.interactive_binary_search(pass, block, 0, block_size, ctx)
        }
    }

    /// Ask for the next block of the current pass, or open the next pass.
    /// The terminal request (one past the last pass) still goes out so the
    /// sender can retire too.
    fn request_next_checksum<M: From<CascadeMsg>>(
        &mut self,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.state < self.checksum_table.len(),
            "no pass in flight to continue"
        );
        let block;
        if self.checksum_table[self.state].len() > self.another_checksum[self.state].len() {
            block = self.another_checksum[self.state].len()
        } else {
            self.state += 1;
            block = 0;
            self.another_checksum.push(Vec::new());
            if self.state >= self.checksum_table.len() {
                self.end_time.get_or_insert(ctx.now());
            }
        }
        self.send_to_peer(
            ctx,
            CascadeMsg::SendChecksum {
                pass: self.state,
                block,
            },
        )
    }

    /// Sender side: parity of a sub-range of one block.
    fn send_for_binary<M: From<CascadeMsg>>(
        &self,
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(entity = ctx.name(), pass, block, start, end, "send_for_binary");
        let key = self.key.as_ref().ok_or(anyhow::anyhow!("no key yet"))?;
        let checksum = self.block_parity(key, pass, block, start, end)?;
        self.send_to_peer(
            ctx,
            CascadeMsg::ReceiveForBinary {
                pass,
                block,
                start,
                end,
                checksum,
            },
        )
    }

    /// Receiver side: one step of the interactive binary search. An agreeing
    /// half is dropped on the floor, its sibling carries the disagreement.
    fn receive_for_binary<M: From<CascadeMsg>>(
        &mut self,
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
        checksum: bool,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(
            entity = ctx.name(),
            pass, block, start, end, checksum, "receive_for_binary"
        );
        let local = {
            let key = self.key.as_ref().ok_or(anyhow::anyhow!("no key yet"))?;
            self.block_parity(key, pass, block, start, end)?
        };
        if local == checksum {
            return Ok(());
        }
        if end - start > 1 {
            return self.interactive_binary_search(pass, block, start, end, ctx);
        }

        // cornered a single disagreeing bit
        let bit = self.block_id_to_index[pass][block][start];
        self.key
            .as_mut()
            .ok_or(anyhow::anyhow!("no key yet"))?
            .flip(bit);
        self.flips.push(bit);
        debug!(entity = ctx.name(), bit, "flip");
        // patch every pass's checksum so they keep matching the flipped key
        for pass_id in 1..self.checksum_table.len() {
            let block_id = self.index_to_block_id[pass_id][bit];
            self.checksum_table[pass_id][block_id] ^= true
        }
        // a flip can expose a stale parity in an earlier, larger block; chase
        // that first, resume the walk only when nothing earlier disagrees
        if self.state == 1 || !self.correct_error_in_previous(ctx)? {
            self.request_next_checksum(ctx)?
        }
        Ok(())
    }

    /// Split `[start, end)` and ask the sender for both halves' parities.
    fn interactive_binary_search<M: From<CascadeMsg>>(
        &self,
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<()> {
        debug!(
            entity = ctx.name(),
            pass, block, start, end, "interactive_binary_search"
        );
        let mid = (start + end) / 2;
        self.send_to_peer(
            ctx,
            CascadeMsg::SendForBinary {
                pass,
                block,
                start,
                end: mid,
            },
        )?;
        self.send_to_peer(
            ctx,
            CascadeMsg::SendForBinary {
                pass,
                block,
                start: mid,
                end,
            },
        )
    }

    /// Scan the passes before the current one for a block whose banked peer
    /// checksum no longer matches, and reopen the search there.
    fn correct_error_in_previous<M: From<CascadeMsg>>(
        &mut self,
        ctx: &mut Context<'_, M>,
    ) -> anyhow::Result<bool> {
        for pass in 1..self.state {
            for block in 0..self.another_checksum[pass].len() {
                if self.checksum_table[pass][block] != self.another_checksum[pass][block] {
                    let block_size = self.block_id_to_index[pass][block].len();
                    self.interactive_binary_search(pass, block, 0, block_size, ctx)?;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn block_indices(&self, pass: usize, block: usize) -> anyhow::Result<&[usize]> {
        self.block_id_to_index
            .get(pass)
            .and_then(|blocks| blocks.get(block))
            .map(Vec::as_slice)
            .ok_or(anyhow::anyhow!("unknown block: pass {pass} block {block}"))
    }

    /// Parity of `key` over sub-range `[start, end)` of one block. Pass-1
    /// blocks are contiguous bit runs, so they take the word-at-a-time scan;
    /// permuted passes pay the per-index gather.
    fn block_parity(
        &self,
        key: &Key,
        pass: usize,
        block: usize,
        start: usize,
        end: usize,
    ) -> anyhow::Result<bool> {
        let indices = self.block_indices(pass, block)?;
        anyhow::ensure!(
            start <= end && end <= indices.len(),
            "sub-block [{start}, {end}) out of range for pass {pass} block {block}"
        );
        if pass == 1 {
            let base = block * self.k;
            Ok(key.range_parity(base + start, base + end))
        } else {
            Ok(key.parity_over(&indices[start..end]))
        }
    }
}

impl<M> Entity<M> for Cascade
where
    M: From<CascadeMsg> + From<Bb84Msg> + TryInto<CascadeMsg>,
    <M as TryInto<CascadeMsg>>::Error: std::fmt::Display,
{
    fn on_event(&mut self, event: M, ctx: &mut Context<'_, M>) -> anyhow::Result<()> {
        let event: CascadeMsg = event
            .try_into()
            .map_err(|err| anyhow::anyhow!("not a cascade message: {err}"))?;
        match event {
            CascadeMsg::GenerateKey { keylen } => self.generate_key(keylen, ctx),
            CascadeMsg::KeyFromBb84 { key } => self.key_from_bb84(key, ctx),
            CascadeMsg::ReceiveKey { key } => self.receive_key(key, ctx),
            CascadeMsg::ReceiveParams { k, keylen } => self.receive_params(k, keylen, ctx),
            CascadeMsg::SendChecksum { pass, block } => self.send_checksum(pass, block, ctx),
            CascadeMsg::ReceiveChecksum {
                pass,
                block,
                checksum,
            } => self.receive_checksum(pass, block, checksum, ctx),
            CascadeMsg::SendForBinary {
                pass,
                block,
                start,
                end,
            } => self.send_for_binary(pass, block, start, end, ctx),
            CascadeMsg::ReceiveForBinary {
                pass,
                block,
                start,
                end,
                checksum,
            } => self.receive_for_binary(pass, block, start, end, checksum, ctx),
        }
    }
}

/// Largest block size `k` whose expected undetected-error mass stays within
/// `ln(2)/2`, found by monotone bisection: the largest `k` with
/// `k·p − (1 − (1 − 2p)^k)/2 ≤ ln(2)/2`.
pub fn get_k1(p: f64, lower: usize, upper: usize) -> usize {
    let limit = std::f64::consts::LN_2 / 2.0;
    let merit = |k: i64| k as f64 * p - (1.0 - (1.0 - 2.0 * p).powi(k as i32)) / 2.0;
    let (mut lower, mut upper) = (lower as i64, upper as i64);
    while lower <= upper {
        let k1 = (lower + upper) / 2;
        match merit(k1).partial_cmp(&limit) {
            Some(std::cmp::Ordering::Less) => lower = k1 + 1,
            Some(std::cmp::Ordering::Greater) => upper = k1 - 1,
            _ => return k1 as usize,
        }
    }
    // merit(0) == 0, the search never leaves with lower == 0
    (lower - 1) as usize
}

/// The pass permutation both parties agree on: seeded by the pass id alone.
fn block_permutation(pass: usize, keylen: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..keylen).collect();
    order.shuffle(&mut StdRng::seed_from_u64(pass as u64));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_fixture(role: Role, k: usize, keylen: usize, w: usize, key: Key) -> Cascade {
        let mut cascade = Cascade::new(role, 0).with_passes(w);
        cascade.k = k;
        cascade.keylen = keylen;
        cascade.key = Some(key);
        cascade.create_checksum_table().unwrap();
        cascade
    }

    #[test]
    fn get_k1_sits_on_the_boundary() {
        let limit = std::f64::consts::LN_2 / 2.0;
        for p in [1e-4, 0.01, 0.05, 0.15] {
            let k = get_k1(p, 0, SAMPLE_LEN);
            let merit = |k: usize| k as f64 * p - (1.0 - (1.0 - 2.0 * p).powi(k as i32)) / 2.0;
            assert!(merit(k) <= limit, "p = {p}: k = {k} overshoots");
            assert!(merit(k + 1) > limit, "p = {p}: k = {k} is not maximal");
        }
    }

    #[test]
    fn block_permutation_is_deterministic() {
        assert_eq!(block_permutation(2, 500), block_permutation(2, 500));
        assert_ne!(block_permutation(2, 500), block_permutation(3, 500));
        let mut sorted = block_permutation(4, 500);
        sorted.sort_unstable();
        assert_eq!(sorted, (0..500).collect::<Vec<_>>());
    }

    #[test]
    fn both_roles_build_identical_tables() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let sender = table_fixture(Role::Sender, 14, 1_000, 4, Key::random(&mut rng, 1_000));
        let receiver = table_fixture(Role::Receiver, 14, 1_000, 4, Key::random(&mut rng, 1_000));
        assert_eq!(sender.index_to_block_id, receiver.index_to_block_id);
        assert_eq!(sender.block_id_to_index, receiver.block_id_to_index);
        // different keys, so the checksums themselves need not agree
        assert_eq!(sender.passes(), 4);
    }

    #[test]
    fn table_shapes_and_round_trip() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let (k, keylen) = (14, 1_000);
        let cascade = table_fixture(Role::Receiver, k, keylen, 4, Key::random(&mut rng, keylen));
        for pass in 1..=cascade.passes() {
            let block_size = k << (pass - 1);
            assert_eq!(
                cascade.checksum_table[pass].len(),
                keylen.div_ceil(block_size)
            );
            let mut seen = vec![0usize; keylen];
            for index in 0..keylen {
                let block = cascade.index_to_block_id[pass][index];
                assert!(
                    cascade.block_id_to_index[pass][block].contains(&index),
                    "pass {pass}: index {index} missing from its block"
                );
            }
            for indices in &cascade.block_id_to_index[pass] {
                for &index in indices {
                    seen[index] += 1
                }
            }
            assert!(seen.iter().all(|&count| count == 1));
        }
    }

    #[test]
    fn checksums_match_key_parity() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let cascade = table_fixture(Role::Sender, 9, 431, 4, Key::random(&mut rng, 431));
        assert!(cascade.checksum_consistent());
    }

    #[test]
    fn pass_growth_is_capped_by_key_length() {
        let key = Key::ones(1_000);
        // 600 * 2^1 / 2 < 1000, 600 * 2^2 / 2 >= 1000
        assert_eq!(table_fixture(Role::Sender, 600, 1_000, 4, key).passes(), 2);
        // with k outgrowing the key, only pass 1 is constructed
        let key = Key::ones(256);
        assert_eq!(table_fixture(Role::Sender, 7_000, 256, 4, key).passes(), 1);
    }
}
