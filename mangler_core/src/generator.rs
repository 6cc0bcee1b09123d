use crate::bits::Bits;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

/// Errors raised by generator traversal.
#[derive(Error, Debug)]
pub enum GeneratorError {
    /// `next_value` was called after the sequence ended.
    #[error("generator exhausted")]
    Exhausted,
}

/// A restartable lazy sequence.
///
/// Generators are single-use per traversal: callers poll [`has_next`] and
/// pull with [`next_value`], which fails with [`GeneratorError::Exhausted`]
/// past the end. [`rewind`] restores the initial state exactly and is
/// idempotent, so a finite generator collects to the same values after any
/// number of rewinds.
///
/// [`has_next`]: Generator::has_next
/// [`next_value`]: Generator::next_value
/// [`rewind`]: Generator::rewind
pub trait Generator: Send {
    type Item;

    fn has_next(&self) -> bool;
    fn next_value(&mut self) -> Result<Self::Item, GeneratorError>;
    fn rewind(&mut self);
}

impl<G: Generator + ?Sized> Generator for Box<G> {
    type Item = G::Item;

    fn has_next(&self) -> bool {
        (**self).has_next()
    }

    fn next_value(&mut self) -> Result<Self::Item, GeneratorError> {
        (**self).next_value()
    }

    fn rewind(&mut self) {
        (**self).rewind()
    }
}

/// Drains a generator into a vector. Test and counting helper; do not call
/// on infinite generators.
pub fn collect_all<G: Generator + ?Sized>(gen: &mut G) -> Vec<G::Item> {
    let mut out = Vec::new();
    while gen.has_next() {
        match gen.next_value() {
            Ok(v) => out.push(v),
            Err(_) => break,
        }
    }
    out
}

/// A transformation applied to each emitted byte string.
pub type Transform = Box<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

fn apply_transforms(transforms: &[Transform], mut value: Vec<u8>) -> Vec<u8> {
    for t in transforms {
        value = t(value);
    }
    value
}

/// Expands the repetition counts for a [`Repeater`].
///
/// With `step == 0` the count grows exponentially: `start`, then
/// `start + 2^k + 1` for `k = 1, 2, …` while below `limit`, finally `limit`
/// itself. `0` never appears as a count.
pub(crate) fn repeat_counts(start: usize, step: usize, limit: usize) -> Vec<usize> {
    let mut counts = Vec::new();
    if step == 0 {
        if start > 0 && start <= limit {
            counts.push(start);
        }
        let mut k = 1u32;
        loop {
            let Some(pow) = 2usize.checked_pow(k) else {
                break;
            };
            let i = start + pow + 1;
            if i >= limit {
                break;
            }
            counts.push(i);
            k += 1;
        }
        if limit > 0 && counts.last() != Some(&limit) {
            counts.push(limit);
        }
    } else {
        let mut i = start;
        while i <= limit {
            if i > 0 {
                counts.push(i);
            }
            i += step;
        }
    }
    counts
}

/// Emits each series element repeated a growing number of times.
pub struct Repeater {
    series: Vec<Vec<u8>>,
    counts: Vec<usize>,
    transforms: Vec<Transform>,
    series_idx: usize,
    count_idx: usize,
}

impl Repeater {
    pub fn new(
        series: Vec<Vec<u8>>,
        start: usize,
        step: usize,
        limit: usize,
        transforms: Vec<Transform>,
    ) -> Self {
        Repeater {
            series,
            counts: repeat_counts(start, step, limit),
            transforms,
            series_idx: 0,
            count_idx: 0,
        }
    }
}

impl Generator for Repeater {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.series_idx < self.series.len() && self.count_idx < self.counts.len()
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        let element = &self.series[self.series_idx];
        let count = self.counts[self.count_idx];
        let value = element.repeat(count);

        self.count_idx += 1;
        if self.count_idx == self.counts.len() && self.series_idx + 1 < self.series.len() {
            self.count_idx = 0;
            self.series_idx += 1;
        }
        Ok(apply_transforms(&self.transforms, value))
    }

    fn rewind(&mut self) {
        self.series_idx = 0;
        self.count_idx = 0;
    }
}

/// Yields a deep-copied value through the transform pipeline `limit` times,
/// or forever when `limit == -1`.
pub struct Static {
    value: Vec<u8>,
    limit: i64,
    transforms: Vec<Transform>,
    emitted: i64,
}

impl Static {
    pub fn new(value: Vec<u8>, limit: i64, transforms: Vec<Transform>) -> Self {
        Static {
            value,
            limit,
            transforms,
            emitted: 0,
        }
    }
}

impl Generator for Static {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.limit < 0 || self.emitted < self.limit
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        self.emitted += 1;
        Ok(apply_transforms(&self.transforms, self.value.clone()))
    }

    fn rewind(&mut self) {
        self.emitted = 0;
    }
}

/// Emits every tuple of the child generators' values in lexicographic
/// order, the first child varying slowest.
pub struct Cartesian<T> {
    children: Vec<Box<dyn Generator<Item = T> + Send>>,
    current: Vec<T>,
    primed: bool,
    done: bool,
}

impl<T: Clone + Send> Cartesian<T> {
    pub fn new(children: Vec<Box<dyn Generator<Item = T> + Send>>) -> Self {
        let done = children.is_empty() || children.iter().any(|c| !c.has_next());
        Cartesian {
            children,
            current: Vec::new(),
            primed: false,
            done,
        }
    }
}

impl<T: Clone + Send> Generator for Cartesian<T> {
    type Item = Vec<T>;

    fn has_next(&self) -> bool {
        if self.done {
            return false;
        }
        if !self.primed {
            return true;
        }
        self.children.iter().any(|c| c.has_next())
    }

    fn next_value(&mut self) -> Result<Vec<T>, GeneratorError> {
        if self.done {
            return Err(GeneratorError::Exhausted);
        }
        if !self.primed {
            for child in &mut self.children {
                self.current.push(child.next_value()?);
            }
            self.primed = true;
            return Ok(self.current.clone());
        }
        // Odometer: advance the last wheel, carrying into slower wheels.
        let mut pos = self.children.len();
        loop {
            if pos == 0 {
                self.done = true;
                return Err(GeneratorError::Exhausted);
            }
            pos -= 1;
            if self.children[pos].has_next() {
                self.current[pos] = self.children[pos].next_value()?;
                break;
            }
            self.children[pos].rewind();
            self.current[pos] = self.children[pos].next_value()?;
        }
        Ok(self.current.clone())
    }

    fn rewind(&mut self) {
        for child in &mut self.children {
            child.rewind();
        }
        self.current.clear();
        self.primed = false;
        self.done = self.children.is_empty() || self.children.iter().any(|c| !c.has_next());
    }
}

/// Concatenates child sequences, terminating when all are exhausted.
pub struct Chain<T> {
    children: Vec<Box<dyn Generator<Item = T> + Send>>,
    idx: usize,
}

impl<T: Send> Chain<T> {
    pub fn new(children: Vec<Box<dyn Generator<Item = T> + Send>>) -> Self {
        Chain { children, idx: 0 }
    }
}

impl<T: Send> Generator for Chain<T> {
    type Item = T;

    fn has_next(&self) -> bool {
        self.children[self.idx..].iter().any(|c| c.has_next())
    }

    fn next_value(&mut self) -> Result<T, GeneratorError> {
        while self.idx < self.children.len() {
            if self.children[self.idx].has_next() {
                return self.children[self.idx].next_value();
            }
            self.idx += 1;
        }
        Err(GeneratorError::Exhausted)
    }

    fn rewind(&mut self) {
        for child in &mut self.children {
            child.rewind();
        }
        self.idx = 0;
    }
}

/// Maximum number of digests remembered by [`DuplicateFilter`].
const DUPLICATE_WINDOW: usize = 10_000;

/// Suppresses values whose digest was seen within a bounded recency window.
pub struct DuplicateFilter {
    inner: Box<dyn Generator<Item = Vec<u8>> + Send>,
    window: VecDeque<[u8; 16]>,
    seen: HashSet<[u8; 16]>,
    pending: Option<Vec<u8>>,
}

impl DuplicateFilter {
    pub fn new(inner: Box<dyn Generator<Item = Vec<u8>> + Send>) -> Self {
        let mut filter = DuplicateFilter {
            inner,
            window: VecDeque::new(),
            seen: HashSet::new(),
            pending: None,
        };
        filter.advance();
        filter
    }

    /// Pulls from the inner generator until an unseen value is buffered.
    fn advance(&mut self) {
        self.pending = None;
        while self.inner.has_next() {
            let Ok(candidate) = self.inner.next_value() else {
                return;
            };
            let digest = md5::compute(&candidate).0;
            if self.seen.contains(&digest) {
                continue;
            }
            if self.window.len() == DUPLICATE_WINDOW {
                if let Some(evicted) = self.window.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
            self.window.push_back(digest);
            self.seen.insert(digest);
            self.pending = Some(candidate);
            return;
        }
    }
}

impl Generator for DuplicateFilter {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.pending.is_some()
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        let value = self.pending.take().ok_or(GeneratorError::Exhausted)?;
        self.advance();
        Ok(value)
    }

    fn rewind(&mut self) {
        self.inner.rewind();
        self.window.clear();
        self.seen.clear();
        self.advance();
    }
}

/// How many boundary widths [`corner_cases`] explores for a bit length.
fn corner_depth(bitlength: usize) -> usize {
    if bitlength < 8 {
        1
    } else if bitlength < 16 {
        2
    } else if bitlength < 32 {
        3
    } else {
        4
    }
}

fn width_mask(bitlength: usize) -> u128 {
    if bitlength >= 128 {
        u128::MAX
    } else {
        (1u128 << bitlength) - 1
    }
}

/// The deterministic corner integers for a width, deduplicated in emission
/// order: all-ones, all-zeros, then per boundary width the high/low runs and
/// their complements, then the alternating patterns.
pub fn corner_cases(bitlength: usize) -> Vec<u128> {
    let mask = width_mask(bitlength);
    let mut cases = Vec::new();
    let mut push = |v: u128| {
        if !cases.contains(&v) {
            cases.push(v);
        }
    };

    push(mask);
    push(0);
    for k in 1..=corner_depth(bitlength).min(bitlength) {
        let low_ones = width_mask(k);
        let high_ones = (low_ones << (bitlength - k)) & mask;
        push(high_ones);
        push(low_ones);
        push(mask ^ high_ones);
        push(mask ^ low_ones);
    }

    let mut alternating_10 = 0u128;
    let mut alternating_01 = 0u128;
    for pos in 0..bitlength {
        alternating_10 = (alternating_10 << 1) | u128::from(pos % 2 == 0);
        alternating_01 = (alternating_01 << 1) | u128::from(pos % 2 == 1);
    }
    push(alternating_10);
    push(alternating_01);
    cases
}

/// Emits the [`corner_cases`] of a width, one integer at a time.
pub struct BinaryCornerCases {
    cases: Vec<u128>,
    idx: usize,
}

impl BinaryCornerCases {
    pub fn new(bitlength: usize) -> Self {
        BinaryCornerCases {
            cases: corner_cases(bitlength),
            idx: 0,
        }
    }
}

impl Generator for BinaryCornerCases {
    type Item = u128;

    fn has_next(&self) -> bool {
        self.idx < self.cases.len()
    }

    fn next_value(&mut self) -> Result<u128, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        let value = self.cases[self.idx];
        self.idx += 1;
        Ok(value)
    }

    fn rewind(&mut self) {
        self.idx = 0;
    }
}

/// Emits every `width`-bit integer as a left-padded bit string.
pub struct EnumerateBits {
    width: usize,
    next: u128,
    total: u128,
}

impl EnumerateBits {
    pub fn new(width: usize) -> Self {
        debug_assert!(width <= 64, "enumeration above 64 bits never terminates");
        EnumerateBits {
            width,
            next: 0,
            total: 1u128 << width,
        }
    }
}

impl Generator for EnumerateBits {
    type Item = Bits;

    fn has_next(&self) -> bool {
        self.next < self.total
    }

    fn next_value(&mut self) -> Result<Bits, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        let value = Bits::from_uint(self.next, self.width);
        self.next += 1;
        Ok(value)
    }

    fn rewind(&mut self) {
        self.next = 0;
    }
}

/// Emits `count` uniform integers in `[0, 2^width)` from a fixed seed, so a
/// rewound traversal repeats the same values.
pub struct RandCases {
    width: usize,
    count: usize,
    seed: [u8; 32],
    rng: ChaCha8Rng,
    emitted: usize,
}

impl RandCases {
    pub fn new(width: usize, count: usize, seed: [u8; 32]) -> Self {
        RandCases {
            width,
            count,
            seed,
            rng: ChaCha8Rng::from_seed(seed),
            emitted: 0,
        }
    }
}

fn random_width(rng: &mut ChaCha8Rng, width: usize) -> u128 {
    use rand::Rng;
    let raw: u128 = rng.random();
    if width >= 128 {
        raw
    } else {
        raw >> (128 - width)
    }
}

impl Generator for RandCases {
    type Item = u128;

    fn has_next(&self) -> bool {
        self.emitted < self.count
    }

    fn next_value(&mut self) -> Result<u128, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        self.emitted += 1;
        Ok(random_width(&mut self.rng, self.width))
    }

    fn rewind(&mut self) {
        self.rng = ChaCha8Rng::from_seed(self.seed);
        self.emitted = 0;
    }
}

/// Byte-swaps `value` within `width` bits; `width` must be a multiple of 8.
fn swap_within(value: u128, width: usize) -> u128 {
    let mut out = 0u128;
    let bytes = width / 8;
    for i in 0..bytes {
        let byte = (value >> (8 * i)) & 0xFF;
        out |= byte << (8 * (bytes - 1 - i));
    }
    out
}

/// Slides a window over the bit representation of a byte string, emitting
/// arithmetic corruptions, corner cases and optional random values at each
/// position. Output length always equals input length.
pub struct RollingCorrupt {
    original: Bits,
    window_bits: usize,
    step_bits: usize,
    random_cases: usize,
    little_endian: bool,
    seed: [u8; 32],
    rng: ChaCha8Rng,
    position: usize,
    queue: VecDeque<u128>,
    done: bool,
}

impl RollingCorrupt {
    pub fn new(
        bytes: &[u8],
        window_bits: usize,
        step_bits: usize,
        random_cases: usize,
        little_endian: bool,
    ) -> Self {
        Self::with_seed(
            bytes,
            window_bits,
            step_bits,
            random_cases,
            little_endian,
            [0u8; 32],
        )
    }

    pub fn with_seed(
        bytes: &[u8],
        window_bits: usize,
        step_bits: usize,
        random_cases: usize,
        little_endian: bool,
        seed: [u8; 32],
    ) -> Self {
        let original = Bits::from_bytes(bytes);
        let done = original.is_empty() || window_bits == 0;
        let mut gen = RollingCorrupt {
            original,
            window_bits,
            step_bits: step_bits.max(1),
            random_cases,
            little_endian,
            seed,
            rng: ChaCha8Rng::from_seed(seed),
            position: 0,
            queue: VecDeque::new(),
            done,
        };
        if !gen.done {
            gen.fill_queue();
        }
        gen
    }

    /// The window width at the current position, clamped at the tail.
    fn window_width(&self) -> usize {
        self.window_bits
            .min(self.original.len().saturating_sub(self.position))
    }

    /// True when byte-swapped window arithmetic applies at this position.
    fn swapped(&self, width: usize) -> bool {
        self.little_endian
            && matches!(self.window_bits, 16 | 32 | 64)
            && width == self.window_bits
    }

    /// Precomputes every emission for the current window position: the
    /// interleaved ±1..9 deltas, the corner cases, then the random values.
    fn fill_queue(&mut self) {
        let width = self.window_width();
        let mask = width_mask(width);
        let raw = self
            .original
            .slice(self.position, self.position + width)
            .to_uint()
            .unwrap_or(0);
        let value = if self.swapped(width) {
            swap_within(raw, width)
        } else {
            raw
        };

        self.queue.clear();
        for magnitude in 1..=9u128 {
            self.queue.push_back(value.wrapping_add(magnitude) & mask);
            self.queue.push_back(value.wrapping_sub(magnitude) & mask);
        }
        for corner in corner_cases(width) {
            self.queue.push_back(corner);
        }
        for _ in 0..self.random_cases {
            self.queue.push_back(random_width(&mut self.rng, width));
        }
    }

    fn emit(&self, corrupted: u128, width: usize) -> Vec<u8> {
        let stored = if self.swapped(width) {
            swap_within(corrupted, width)
        } else {
            corrupted
        };
        let mut bits = self.original.slice(0, self.position);
        bits.extend(&Bits::from_uint(stored, width));
        bits.extend(
            &self
                .original
                .slice(self.position + width, self.original.len()),
        );
        bits.to_bytes()
    }

    fn step_position(&mut self) {
        self.position += self.step_bits;
        if self.position >= self.original.len() {
            self.done = true;
        } else {
            self.fill_queue();
        }
    }
}

impl Generator for RollingCorrupt {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        !self.done
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        if self.done {
            return Err(GeneratorError::Exhausted);
        }
        let width = self.window_width();
        let corrupted = self.queue.pop_front().ok_or(GeneratorError::Exhausted)?;
        let emitted = self.emit(corrupted, width);
        if self.queue.is_empty() {
            self.step_position();
        }
        Ok(emitted)
    }

    fn rewind(&mut self) {
        self.position = 0;
        self.rng = ChaCha8Rng::from_seed(self.seed);
        self.done = self.original.is_empty() || self.window_bits == 0;
        if !self.done {
            self.fill_queue();
        }
    }
}

/// Repeatedly removes the middle third of a byte string until fewer than
/// three bytes remain.
///
/// Each step keeps the left `ceil(len/3)` and right `floor((len-1)/3)`
/// bytes, which removes a true middle third for every length class.
pub struct Chop {
    original: Vec<u8>,
    current: Vec<u8>,
}

impl Chop {
    pub fn new(bytes: &[u8]) -> Self {
        Chop {
            original: bytes.to_vec(),
            current: bytes.to_vec(),
        }
    }
}

impl Generator for Chop {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.current.len() >= 3
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        let len = self.current.len();
        if len < 3 {
            return Err(GeneratorError::Exhausted);
        }
        let left = len.div_ceil(3);
        let right = (len - 1) / 3;
        let mut next = self.current[..left].to_vec();
        next.extend_from_slice(&self.current[len - right..]);
        self.current = next.clone();
        Ok(next)
    }

    fn rewind(&mut self) {
        self.current = self.original.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeater_steps_arithmetically_and_skips_zero() {
        let mut gen = Repeater::new(vec![b"A".to_vec()], 0, 2, 6, Vec::new());
        let values = collect_all(&mut gen);
        let lens: Vec<usize> = values.iter().map(Vec::len).collect();
        assert_eq!(lens, vec![2, 4, 6]);
        assert_eq!(values[0], b"AA");
    }

    #[test]
    fn repeater_zero_step_grows_exponentially_to_limit() {
        let mut gen = Repeater::new(vec![b"x".to_vec()], 1, 0, 100, Vec::new());
        let lens: Vec<usize> = collect_all(&mut gen).iter().map(Vec::len).collect();
        // 1, then 1 + 2^k + 1 while < 100, then the limit itself.
        assert_eq!(lens, vec![1, 4, 6, 10, 18, 34, 66, 100]);
    }

    #[test]
    fn repeater_applies_transform_pipeline() {
        let upper: Transform = Box::new(|v| v.to_ascii_uppercase());
        let mut gen = Repeater::new(vec![b"ab".to_vec()], 1, 1, 2, vec![upper]);
        assert_eq!(collect_all(&mut gen), vec![b"AB".to_vec(), b"ABAB".to_vec()]);
    }

    #[test]
    fn static_respects_limit_and_minus_one_is_forever() {
        let mut gen = Static::new(b"hi".to_vec(), 3, Vec::new());
        assert_eq!(collect_all(&mut gen).len(), 3);
        assert!(matches!(
            gen.next_value(),
            Err(GeneratorError::Exhausted)
        ));

        let mut forever = Static::new(b"hi".to_vec(), -1, Vec::new());
        for _ in 0..1000 {
            forever.next_value().unwrap();
        }
        assert!(forever.has_next());
    }

    #[test]
    fn cartesian_varies_first_argument_slowest() {
        let a: Box<dyn Generator<Item = u128> + Send> = Box::new(BinaryCornerCases::new(1));
        let b: Box<dyn Generator<Item = u128> + Send> = Box::new(BinaryCornerCases::new(1));
        // corner_cases(1) == [1, 0]
        let mut gen = Cartesian::new(vec![a, b]);
        let tuples = collect_all(&mut gen);
        assert_eq!(
            tuples,
            vec![vec![1, 1], vec![1, 0], vec![0, 1], vec![0, 0]]
        );
    }

    #[test]
    fn chain_concatenates_children() {
        let a: Box<dyn Generator<Item = u128> + Send> = Box::new(BinaryCornerCases::new(1));
        let b: Box<dyn Generator<Item = u128> + Send> = Box::new(BinaryCornerCases::new(1));
        let mut gen = Chain::new(vec![a, b]);
        assert_eq!(collect_all(&mut gen), vec![1, 0, 1, 0]);
    }

    #[test]
    fn duplicate_filter_suppresses_repeats() {
        let inner = Box::new(Repeater::new(
            vec![b"a".to_vec(), b"a".to_vec(), b"b".to_vec()],
            1,
            1,
            2,
            Vec::new(),
        ));
        let mut gen = DuplicateFilter::new(inner);
        let values = collect_all(&mut gen);
        assert_eq!(
            values,
            vec![b"a".to_vec(), b"aa".to_vec(), b"b".to_vec(), b"bb".to_vec()]
        );
    }

    #[test]
    fn corner_cases_8_bits_match_expected_order() {
        let mut gen = BinaryCornerCases::new(8);
        assert_eq!(
            collect_all(&mut gen),
            vec![0xFF, 0x00, 0x80, 0x01, 0x7F, 0xFE, 0xC0, 0x03, 0x3F, 0xFC, 0xAA, 0x55]
        );
    }

    #[test]
    fn corner_cases_have_no_duplicates_and_grow_with_width() {
        let mut previous = 0usize;
        for width in 1..=64 {
            let cases = corner_cases(width);
            let unique: HashSet<u128> = cases.iter().copied().collect();
            assert_eq!(unique.len(), cases.len(), "duplicates at width {width}");
            assert!(
                cases.len() >= previous,
                "cardinality shrank at width {width}"
            );
            previous = cases.len();
        }
    }

    #[test]
    fn enumerate_bits_covers_the_full_range_left_padded() {
        let mut gen = EnumerateBits::new(3);
        let values = collect_all(&mut gen);
        assert_eq!(values.len(), 8);
        assert_eq!(values[0].to_string(), "000");
        assert_eq!(values[5].to_string(), "101");
        assert_eq!(values[7].to_string(), "111");
    }

    #[test]
    fn rand_cases_stay_in_range_and_repeat_after_rewind() {
        let mut gen = RandCases::new(12, 50, [7u8; 32]);
        let first = collect_all(&mut gen);
        assert_eq!(first.len(), 50);
        assert!(first.iter().all(|v| *v < (1 << 12)));
        gen.rewind();
        assert_eq!(collect_all(&mut gen), first);
    }

    #[test]
    fn rolling_corrupt_first_deltas_match_plus_then_minus_one() {
        let mut gen = RollingCorrupt::new(b"AB", 8, 8, 0, false);
        assert_eq!(gen.next_value().unwrap(), b"BB");
        assert_eq!(gen.next_value().unwrap(), b"@B");
        assert_eq!(gen.next_value().unwrap(), b"CB");
        assert_eq!(gen.next_value().unwrap(), b"?B");
    }

    #[test]
    fn rolling_corrupt_advances_to_second_byte() {
        let mut gen = RollingCorrupt::new(b"AB", 8, 8, 0, false);
        let values = collect_all(&mut gen);
        // 18 deltas + 12 corner cases per byte position.
        assert_eq!(values.len(), 2 * (18 + 12));
        assert_eq!(values[30], b"AC");
        assert_eq!(values[31], b"AA");
    }

    #[test]
    fn rolling_corrupt_preserves_input_length() {
        let input = b"\x01\x02\x03\x04\x05";
        let mut gen = RollingCorrupt::new(input, 16, 8, 3, false);
        for value in collect_all(&mut gen) {
            assert_eq!(value.len(), input.len());
        }
    }

    #[test]
    fn rolling_corrupt_little_endian_swaps_window_arithmetic() {
        // Window value 0x0100 read little-endian is 0x0001; +1 gives 0x0002,
        // stored back as bytes 02 00.
        let mut gen = RollingCorrupt::new(b"\x01\x00", 16, 16, 0, true);
        assert_eq!(gen.next_value().unwrap(), b"\x02\x00");
        assert_eq!(gen.next_value().unwrap(), b"\x00\x00");
    }

    #[test]
    fn rolling_corrupt_clamps_the_tail_window() {
        let mut gen = RollingCorrupt::new(b"ABC", 16, 16, 0, false);
        for value in collect_all(&mut gen) {
            assert_eq!(value.len(), 3, "tail window must not overrun");
        }
    }

    #[test]
    fn rolling_corrupt_rewind_restores_the_sequence() {
        let mut gen = RollingCorrupt::new(b"xyz", 8, 8, 2, false);
        let first = collect_all(&mut gen);
        gen.rewind();
        assert_eq!(collect_all(&mut gen), first);
    }

    #[test]
    fn chop_reduces_by_middle_thirds() {
        let mut gen = Chop::new(b"abcdefghij");
        assert_eq!(gen.next_value().unwrap(), b"abcdhij");
        assert_eq!(gen.next_value().unwrap(), b"abcij");
        assert_eq!(gen.next_value().unwrap(), b"abi");
        assert_eq!(gen.next_value().unwrap(), b"a");
        assert!(!gen.has_next());
        assert!(matches!(gen.next_value(), Err(GeneratorError::Exhausted)));
    }

    #[test]
    fn chop_nine_bytes_starts_with_abchi() {
        let mut gen = Chop::new(b"abcdefghi");
        assert_eq!(gen.next_value().unwrap(), b"abchi");
        assert_eq!(gen.next_value().unwrap(), b"abi");
        assert_eq!(gen.next_value().unwrap(), b"a");
        assert!(!gen.has_next());
    }

    #[test]
    fn finite_generators_collect_identically_after_rewind() {
        let mut repeater = Repeater::new(vec![b"q".to_vec()], 1, 3, 9, Vec::new());
        let first = collect_all(&mut repeater);
        repeater.rewind();
        repeater.rewind();
        assert_eq!(collect_all(&mut repeater), first);

        let mut corners = BinaryCornerCases::new(16);
        let first = collect_all(&mut corners);
        corners.rewind();
        assert_eq!(collect_all(&mut corners), first);

        let mut chop = Chop::new(b"abcdefghij");
        let first = collect_all(&mut chop);
        chop.rewind();
        assert_eq!(collect_all(&mut chop), first);
    }
}
