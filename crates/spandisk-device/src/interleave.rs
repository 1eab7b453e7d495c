//! Interleave table construction
//!
//! The table maps ranges of the logical address space to the set of
//! components striped across that range. With no interleave each entry
//! covers one whole component (pure concatenation). With an interleave,
//! entries are built greedily: each round picks the smallest component
//! size above the consumed watermark and groups every component at
//! least that large, so smaller components drop out of later entries
//! and mixed sizes still stripe correctly.
//!
//! ```text
//! components 100 + 60 blocks, interleave 10:
//! entry 0: startblk  0, startoff 0, components [0, 1]   (both alive)
//! entry 1: startblk 12, startoff 6, components [0]      (1 exhausted)
//! entry 2: sentinel
//! ```

/// One range of the striped address space
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterleaveEntry {
    /// First logical block of the range, in interleave units
    /// (raw blocks when the table is a concatenation)
    pub start_blk: u64,
    /// Offset into each participating component, in interleave units
    pub start_off: u64,
    /// Participating component indices, in table order
    pub index: Vec<usize>,
}

impl InterleaveEntry {
    /// Number of components striped across this range
    #[must_use]
    pub fn participants(&self) -> usize {
        self.index.len()
    }

    /// Whether this is the terminating sentinel
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.index.is_empty()
    }
}

/// Ordered interleave table, terminated by a zero-participant sentinel
#[derive(Clone, Debug)]
pub struct InterleaveTable {
    entries: Vec<InterleaveEntry>,
    interleave: u64,
}

impl InterleaveTable {
    /// Build the table for the given component sizes (effective, in
    /// blocks) and interleave unit
    #[must_use]
    pub fn build(sizes: &[u64], interleave: u64) -> Self {
        if interleave == 0 {
            return Self::build_concat(sizes);
        }
        Self::build_striped(sizes, interleave)
    }

    /// Trivial case: no interleave. Each entry represents a single
    /// component in its entirety, at its running block offset.
    fn build_concat(sizes: &[u64]) -> Self {
        let mut entries = Vec::with_capacity(sizes.len() + 1);
        let mut bn = 0;
        for (ix, &size) in sizes.iter().enumerate() {
            entries.push(InterleaveEntry {
                start_blk: bn,
                start_off: 0,
                index: vec![ix],
            });
            bn += size;
        }
        entries.push(InterleaveEntry {
            start_blk: 0,
            start_off: 0,
            index: Vec::new(),
        });
        Self {
            entries,
            interleave: 0,
        }
    }

    fn build_striped(sizes: &[u64], interleave: u64) -> Self {
        let mut entries = Vec::new();
        // Watermark of component capacity already consumed, plus the
        // running totals for start_blk / start_off.
        let mut consumed = 0u64;
        let mut bn = 0u64;
        let mut lbn = 0u64;

        loop {
            // Smallest component with capacity above the watermark.
            let Some(smallest) = sizes
                .iter()
                .copied()
                .filter(|&size| size > consumed)
                .min()
            else {
                entries.push(InterleaveEntry {
                    start_blk: 0,
                    start_off: 0,
                    index: Vec::new(),
                });
                break;
            };

            // Every component at least that large takes part.
            let index: Vec<usize> = sizes
                .iter()
                .enumerate()
                .filter(|&(_, &size)| size >= smallest)
                .map(|(ix, _)| ix)
                .collect();

            let participants = index.len() as u64;
            entries.push(InterleaveEntry {
                start_blk: bn / interleave,
                start_off: lbn,
                index,
            });

            bn += participants * (smallest - consumed);
            lbn = smallest / interleave;
            consumed = smallest;
        }

        Self {
            entries,
            interleave,
        }
    }

    /// The interleave unit the table was built with
    #[must_use]
    pub const fn interleave(&self) -> u64 {
        self.interleave
    }

    /// All entries, sentinel included
    #[must_use]
    pub fn entries(&self) -> &[InterleaveEntry] {
        &self.entries
    }

    /// Find the entry owning a stripe index: the last entry whose
    /// `start_blk` does not exceed it
    ///
    /// Valid only for striped tables and in-range stripes (callers
    /// bounds-check against the device size first).
    #[must_use]
    pub fn locate(&self, stripe: u64) -> &InterleaveEntry {
        let mut found = &self.entries[0];
        for entry in &self.entries {
            if entry.is_sentinel() || entry.start_blk > stripe {
                break;
            }
            found = entry;
        }
        found
    }
}
