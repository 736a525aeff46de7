//! Small-allocation size classes.
//!
//! The class table is expanded from one macro so the bin count, the
//! size-to-bin lookup table and the per-bin geometry all derive from a
//! single definition. Classes assume the 8-byte quantum and 4 KiB
//! pages of this kernel: 31 bins from 8 bytes to 3584 bytes, with the
//! spacing doubling every four classes.

/// One size class: `(bin, delta, size)` — the bin index, the spacing
/// from the previous class, and the region size in bytes.
#[derive(Debug, Clone, Copy)]
pub struct SizeClass {
    pub bin: usize,
    pub delta: usize,
    pub size: usize,
}

macro_rules! size_classes {
    ($expand:ident) => {
        $expand! {
            { 0, 8, 8 },
            { 1, 8, 16 },
            { 2, 8, 24 },
            { 3, 8, 32 },
            { 4, 8, 40 },
            { 5, 8, 48 },
            { 6, 8, 56 },
            { 7, 8, 64 },
            { 8, 16, 80 },
            { 9, 16, 96 },
            { 10, 16, 112 },
            { 11, 16, 128 },
            { 12, 32, 160 },
            { 13, 32, 192 },
            { 14, 32, 224 },
            { 15, 32, 256 },
            { 16, 64, 320 },
            { 17, 64, 384 },
            { 18, 64, 448 },
            { 19, 64, 512 },
            { 20, 128, 640 },
            { 21, 128, 768 },
            { 22, 128, 896 },
            { 23, 128, 1024 },
            { 24, 256, 1280 },
            { 25, 256, 1536 },
            { 26, 256, 1792 },
            { 27, 256, 2048 },
            { 28, 512, 2560 },
            { 29, 512, 3072 },
            { 30, 512, 3584 },
        }
    };
}

macro_rules! define_size_classes {
    ($({ $bin:expr, $delta:expr, $size:expr }),+ $(,)?) => {
        pub const SIZE_CLASSES: &[SizeClass] = &[
            $(SizeClass { bin: $bin, delta: $delta, size: $size }),+
        ];
    };
}

size_classes!(define_size_classes);

/// Number of small bins.
pub const NBINS: usize = SIZE_CLASSES.len();

/// Largest small-class size; anything above goes to the large paths.
pub const SMALL_MAXCLASS: usize = 3584;

/// Allocation quantum (and lookup-table step).
pub const LG_QUANTUM: usize = 3;
pub const QUANTUM: usize = 1 << LG_QUANTUM;

/// Lookup table mapping `(size - 1) >> 3` to a bin index for every
/// size from 1 to `SMALL_MAXCLASS`.
static SMALL_SIZE2BIN: [u8; SMALL_MAXCLASS >> LG_QUANTUM] = build_size2bin();

const fn build_size2bin() -> [u8; SMALL_MAXCLASS >> LG_QUANTUM] {
    let mut table = [0u8; SMALL_MAXCLASS >> LG_QUANTUM];
    let mut ndx = 0;
    let mut prev_size = 0;
    while ndx < SIZE_CLASSES.len() {
        let class = SIZE_CLASSES[ndx];
        let mut step = prev_size >> LG_QUANTUM;
        while step < class.size >> LG_QUANTUM {
            table[step] = class.bin as u8;
            step += 1;
        }
        prev_size = class.size;
        ndx += 1;
    }
    table
}

/// Bin serving `size` bytes, or None when the size is large.
pub fn size2bin(size: usize) -> Option<usize> {
    if size == 0 || size > SMALL_MAXCLASS {
        return None;
    }
    Some(SMALL_SIZE2BIN[(size - 1) >> LG_QUANTUM] as usize)
}

/// Region size of a bin.
pub fn bin2size(bin: usize) -> usize {
    SIZE_CLASSES[bin].size
}

/// Round a small request up to its class size.
pub fn small_size_ceiling(size: usize) -> Option<usize> {
    size2bin(size).map(bin2size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_monotonic_and_consistent() {
        assert_eq!(NBINS, 31);
        let mut prev = 0;
        for (ndx, class) in SIZE_CLASSES.iter().enumerate() {
            assert_eq!(class.bin, ndx);
            assert_eq!(class.size, prev + class.delta);
            assert_eq!(class.size % QUANTUM, 0);
            prev = class.size;
        }
        assert_eq!(prev, SMALL_MAXCLASS);
    }

    #[test]
    fn lookup_agrees_with_linear_scan() {
        for size in 1..=SMALL_MAXCLASS {
            let expect = SIZE_CLASSES
                .iter()
                .find(|c| c.size >= size)
                .map(|c| c.bin)
                .unwrap();
            assert_eq!(size2bin(size), Some(expect), "size {size}");
        }
        assert_eq!(size2bin(SMALL_MAXCLASS + 1), None);
        assert_eq!(size2bin(0), None);
    }

    #[test]
    fn boundary_sizes() {
        assert_eq!(size2bin(1), Some(0));
        assert_eq!(size2bin(8), Some(0));
        assert_eq!(size2bin(9), Some(1));
        assert_eq!(size2bin(64), Some(7));
        assert_eq!(size2bin(65), Some(8));
        assert_eq!(size2bin(3584), Some(30));
        assert_eq!(small_size_ceiling(40), Some(40));
        assert_eq!(small_size_ceiling(41), Some(48));
    }
}
