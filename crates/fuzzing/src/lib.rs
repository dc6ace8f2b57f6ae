//! Shared fuzzing and testing infrastructure for `coalescing_arena`.

use coalescing_arena::{Allocator, ArenaConfig, Error};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::collections::BTreeMap;

/// A test operation.
///
/// Ids and sizes are kept to 32 bits so that generated traces reuse ids
/// often and stay within a few arena chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: u32 },
    Free { id: u32 },
    /// Force a coalescing round outside of the schedule.
    Merge,
}

impl DefaultMutate for Op {
    type DefaultMutate = OpMutator;
}

/// A mutator for `Op`s with configurable maximums for ids and sizes.
#[derive(Debug)]
pub struct OpMutator {
    /// Ids are drawn from `0..max_id`.
    pub max_id: u32,
    pub max_size: u32,
}

impl Default for OpMutator {
    fn default() -> Self {
        Self {
            max_id: 64,
            max_size: 3 * 16 * 1024,
        }
    }
}

impl OpMutator {
    fn gen_id(&self, ctx: &mut mutatis::Context) -> u32 {
        ctx.rng()
            .gen_index(self.max_id as usize)
            .map_or(0, |id| id as u32)
    }
}

impl Mutate<Op> for OpMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, op: &mut Op) -> mutatis::Result<()> {
        // Mutate the id.
        c.mutation(|ctx| {
            let new_id = self.gen_id(ctx);
            match op {
                Op::Alloc { id, .. } | Op::Free { id } => {
                    if !ctx.shrink() || new_id < *id {
                        *id = new_id;
                    }
                }
                Op::Merge => {}
            }
            Ok(())
        })?;

        // Mutate the size.
        c.mutation(|ctx| {
            if let Op::Alloc { size, .. } = op {
                let max_size = if ctx.shrink() { *size } else { self.max_size };
                *size = ctx.rng().gen_index(max_size as usize + 1).unwrap() as u32;
            }
            Ok(())
        })?;

        // Replace the op with a new one entirely.
        if !c.shrink() {
            c.mutation(|ctx| {
                *op = self.generate(ctx)?;
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let id = self.gen_id(ctx);
        let op = match ctx.rng().gen_index(16).unwrap() {
            0..=8 => Op::Alloc {
                id,
                size: m::range(0..=self.max_size).generate(ctx)?,
            },
            9..=14 => Op::Free { id },
            _ => Op::Merge,
        };
        Ok(op)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. } | Op::Free { id } => *id = new_id,
                    Op::Merge => {}
                }
            }
            Ok(())
        })?;

        // Free an existing allocation somewhere after it was made.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// The test operations.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against an allocator with the default
    /// configuration.
    pub fn run(&self) -> Result<(), String> {
        self.run_with_config(ArenaConfig::new())
    }

    /// Run these test operations against an allocator with the given
    /// configuration, checking the allocator's invariants after every
    /// operation.
    pub fn run_with_config(&self, config: ArenaConfig) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut allocator = Allocator::with_config(config).map_err(|e| e.to_string())?;
        let chunk_size = config.chunk_size();

        // The sizes we expect each live id to have.
        let mut live = LiveMap::default();

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");
            let total_before = allocator.total_memory();

            match *op {
                Op::Alloc { id, size } => {
                    // Allocating a live id again orphans the old block.
                    live.leak(id);
                    let start = allocator.allocate(id.into(), size.into());
                    ensure!(
                        allocator.allocation(id.into()) == Some((start, size.into())),
                        "id{id} should be recorded at {start:#x} with size {size}",
                    );
                    live.insert(id, size.into());
                }

                Op::Free { id } => match (live.remove(id), allocator.free(id.into())) {
                    (Some(_), Ok(())) => {
                        ensure!(
                            allocator.allocation(id.into()).is_none(),
                            "freed id{id} should no longer be live",
                        );
                    }
                    (None, Err(Error::UnknownAllocationId(unknown))) => {
                        ensure!(
                            unknown == u64::from(id),
                            "error should name id{id}, not id{unknown}",
                        );
                    }
                    (expected, actual) => {
                        return Err(format!(
                            "freeing id{id}: expected live size {expected:?}, got {actual:?}"
                        ));
                    }
                },

                Op::Merge => {
                    allocator.merge();
                    allocator
                        .check_coalesced()
                        .map_err(|e| format!("after forced merge: {e}"))?;
                }
            }

            ensure!(
                allocator.used_memory() == live.used,
                "used memory should be {}, was {}",
                live.used,
                allocator.used_memory(),
            );
            ensure!(
                allocator.leaked_memory() == live.leaked,
                "leaked memory should be {}, was {}",
                live.leaked,
                allocator.leaked_memory(),
            );
            ensure!(
                allocator.total_memory() >= total_before,
                "the arena should never shrink",
            );
            ensure!(
                allocator.total_memory() % chunk_size == 0,
                "the arena should be a whole number of chunks",
            );
            ensure!(
                (0.0..=1.0).contains(&allocator.utilization()),
                "utilization out of range: {}",
                allocator.utilization(),
            );
            allocator
                .check_invariants()
                .map_err(|e| format!("after {op:?}: {e}"))?;
        }

        // Finally, free any remaining live allocations.
        let total = allocator.total_memory();
        for id in live.map.keys() {
            allocator
                .free((*id).into())
                .map_err(|e| format!("freeing remaining id{id}: {e}"))?;
        }
        ensure!(
            allocator.used_memory() == live.leaked,
            "only leaked blocks should be in use after freeing everything",
        );
        ensure!(
            allocator.total_memory() == total,
            "freeing should never change the arena size",
        );

        // And once everything is coalesced, the whole arena is one interval,
        // unless leaked blocks split it up.
        allocator.merge();
        let free: Vec<_> = allocator.free_intervals().collect();
        ensure!(
            total == 0
                || live.leaked > 0
                || (free.len() == 1 && free[0].start == 0 && free[0].size == total),
            "a fully-freed, coalesced arena should be a single interval: {free:?}",
        );
        allocator
            .check_coalesced()
            .map_err(|e| format!("after final merge: {e}"))?;
        allocator
            .check_invariants()
            .map_err(|e| format!("after final merge: {e}"))?;

        Ok(())
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    /// Requested size of each live allocation.
    map: BTreeMap<u32, u64>,

    /// The sum of the requested sizes, including leaked ones.
    used: u64,

    /// The sum of sizes orphaned by allocating a live id again.
    leaked: u64,
}

impl LiveMap {
    fn insert(&mut self, id: u32, size: u64) {
        self.used += size;
        let old = self.map.insert(id, size);
        assert!(
            old.is_none(),
            "should remove old entries before adding new ones"
        );
    }

    fn leak(&mut self, id: u32) {
        if let Some(size) = self.map.remove(&id) {
            self.leaked += size;
        }
    }

    fn remove(&mut self, id: u32) -> Option<u64> {
        let size = self.map.remove(&id)?;
        self.used -= size;
        Some(size)
    }
}
