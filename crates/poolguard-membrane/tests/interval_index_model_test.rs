use std::collections::BTreeMap;

use poolguard_membrane::{IndexError, IntervalIndex, MemoryRegion};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

/// Reference model: begin -> (end, value).
struct Model {
    regions: BTreeMap<usize, (usize, u32)>,
}

impl Model {
    fn lookup(&self, addr: usize) -> Option<(usize, usize, u32)> {
        let (&begin, &(end, value)) = self.regions.range(..=addr).next_back()?;
        (addr < end).then_some((begin, end, value))
    }

    fn overlaps(&self, begin: usize, end: usize) -> bool {
        self.regions.range(..end).next_back().is_some_and(|(_, &(e, _))| e > begin)
    }
}

#[test]
fn deterministic_sequences_match_ordered_map_model() {
    const SEEDS: [u64; 4] = [0x9E37_79B9, 7, 0xDEAD_BEEF, 42];
    const STEPS: usize = 3_000;
    const SPACE: usize = 0x10_000;

    for seed in SEEDS {
        let mut rng = XorShift64::new(seed);
        let mut index = IntervalIndex::new();
        let mut model = Model {
            regions: BTreeMap::new(),
        };

        for step in 0..STEPS {
            match rng.gen_range_usize(0, 9) {
                0..=3 => {
                    let begin = rng.gen_range_usize(1, SPACE);
                    let len = rng.gen_range_usize(1, 0x100);
                    let region = MemoryRegion::with_len(begin, len).unwrap();
                    let value = step as u32;
                    let result = index.insert(region, value);
                    if model.overlaps(begin, begin + len) {
                        assert!(
                            matches!(result, Err(IndexError::Overlap { .. })),
                            "seed={seed} step={step} overlapping insert accepted"
                        );
                    } else {
                        assert_eq!(result, Ok(()), "seed={seed} step={step}");
                        model.regions.insert(begin, (begin + len, value));
                    }
                }
                4..=5 => {
                    let pick = rng.gen_range_usize(0, SPACE);
                    let target = model.lookup(pick).map(|(b, _, _)| b).or_else(|| {
                        model.regions.range(pick..).next().map(|(&b, _)| b)
                    });
                    if let Some(begin) = target {
                        let (end, value) = model.regions.remove(&begin).unwrap();
                        let (region, got) = index.remove_at(begin).unwrap();
                        assert_eq!((region.begin(), region.end(), got), (begin, end, value));
                    } else {
                        assert!(index.remove_at(pick.max(1)).is_err());
                    }
                }
                _ => {
                    let addr = rng.gen_range_usize(0, SPACE + 0x100);
                    let got = index.lookup(addr).map(|(r, v)| (r.begin(), r.end(), v));
                    assert_eq!(got, model.lookup(addr), "seed={seed} step={step} addr={addr:#x}");
                    // A second lookup with no mutation in between must agree.
                    let again = index.lookup(addr).map(|(r, v)| (r.begin(), r.end(), v));
                    assert_eq!(again, got);
                }
            }
            assert_eq!(index.len(), model.regions.len());
        }

        let ordered: Vec<_> = index.iter().map(|(r, v)| (r.begin(), r.end(), v)).collect();
        let expected: Vec<_> = model
            .regions
            .iter()
            .map(|(&b, &(e, v))| (b, e, v))
            .collect();
        assert_eq!(ordered, expected, "seed={seed} iteration order");
    }
}

#[test]
fn every_interior_address_resolves_and_end_does_not() {
    let mut index = IntervalIndex::new();
    let regions = [(0x1000, 0x1400), (0x1400, 0x1410), (0x2000, 0x2001)];
    for (i, &(b, e)) in regions.iter().enumerate() {
        index.insert(MemoryRegion::new(b, e).unwrap(), i).unwrap();
    }
    for (i, &(b, e)) in regions.iter().enumerate() {
        for addr in b..e {
            assert_eq!(index.lookup(addr).map(|(_, v)| v), Some(i), "addr={addr:#x}");
        }
        let after = index.lookup(e).map(|(r, _)| r.begin());
        assert_ne!(after, Some(b), "end of [{b:#x},{e:#x}) must not resolve to it");
    }
}
