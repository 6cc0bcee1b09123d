use crate::binstruct::{Binstruct, BinstructError, Node};
use crate::bits::Bits;
use crate::field::{Endianness, Field, FieldKind, LengthType};
use crate::generator::{Chain, Chop, Generator, GeneratorError, Repeater, RollingCorrupt};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while driving mutations over a structure.
#[derive(Error, Debug)]
pub enum MutationError {
    /// A field kind has no entry in the mutation registry.
    #[error("no mutation capability registered for kind '{0}'")]
    UnknownKind(String),

    /// A leaf disappeared mid-run; the structure was reshaped under us.
    #[error("no such field '{0}'")]
    NoSuchField(String),

    /// Restoring a field after the replace phase left different wire bytes.
    /// This is a bug in the structure or the driver, not in the input.
    #[error("structure corrupt after restoring field '{field}'")]
    RestoreInvariant { field: String },

    #[error(transparent)]
    Binstruct(#[from] BinstructError),
}

/// A boxed byte-string generator, the currency of the registries.
pub type ByteGen = Box<dyn Generator<Item = Vec<u8>> + Send>;

/// Per-kind mutation capability.
///
/// `injection` produces content to splice before or after a field;
/// `replacement` produces substitute content for the field itself. Users
/// extend the engine by registering a capability under a new kind tag and
/// constructing fields with [`FieldKind::Custom`] carrying the same tag.
pub trait FieldMutations: Send + Sync {
    fn injection(&self, max_len: usize) -> ByteGen;

    fn replacement(
        &self,
        field: &Field,
        max_len: usize,
        preserve_length: bool,
        random_cases: usize,
        fuzz_level: u32,
    ) -> ByteGen;
}

const ASCII_ALPHABETICS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Tokens with meaning to most text-ish protocol parsers.
const SYNTAX_TOKENS: &[&[u8]] = &[
    b"<", b">", b"&", b"\"", b"'", b"/", b"\\", b"%", b"=", b";", b":", b"(", b")", b"{", b"}",
    b"[", b"]", b"..", b"//", b"\r\n", b"%n", b"%s",
];

/// Unpaired UTF-16LE surrogate code units.
const BAD_SURROGATES: &[&[u8]] = &[
    b"\x00\xD8",
    b"\xFF\xDB",
    b"\x00\xDC",
    b"\xFF\xDF",
    b"\x01\xD8\x02\xD8",
];

/// Produces one token per requested repetition length by rolling against
/// cumulative percentages and sampling the matched set, then repeating the
/// token to that length.
///
/// In UTF-16 mode single-byte tokens are widened to two bytes and an odd
/// tail gets a zero byte, so emissions stay code-unit aligned.
pub struct MixAndMatch {
    sets: Vec<Vec<Vec<u8>>>,
    cumulative: Vec<u8>,
    counts: Vec<usize>,
    utf16: bool,
    seed: [u8; 32],
    rng: ChaCha8Rng,
    idx: usize,
}

impl MixAndMatch {
    pub fn new(
        max_len: usize,
        sets: Vec<Vec<Vec<u8>>>,
        percentages: &[u8],
        utf16: bool,
        seed: [u8; 32],
    ) -> Self {
        debug_assert_eq!(sets.len(), percentages.len());
        MixAndMatch {
            sets,
            cumulative: percentages.to_vec(),
            counts: crate::generator::repeat_counts(1, 0, max_len),
            utf16,
            seed,
            rng: ChaCha8Rng::from_seed(seed),
            idx: 0,
        }
    }

    fn sample_token(&mut self) -> Vec<u8> {
        let roll: u8 = self.rng.random_range(1..=100);
        let mut chosen = self.sets.len() - 1;
        for (i, bound) in self.cumulative.iter().enumerate() {
            if roll <= *bound {
                chosen = i;
                break;
            }
        }
        let set = &self.sets[chosen];
        let mut token = set[self.rng.random_range(0..set.len())].clone();
        if self.utf16 && token.len() == 1 {
            token.push(0);
        }
        token
    }
}

impl Generator for MixAndMatch {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.idx < self.counts.len()
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        let count = self.counts[self.idx];
        self.idx += 1;
        let token = self.sample_token();
        let mut out = token.repeat(count.div_ceil(token.len().max(1)));
        out.truncate(count.max(token.len()));
        if self.utf16 && out.len() % 2 == 1 {
            out.push(0);
        }
        Ok(out)
    }

    fn rewind(&mut self) {
        self.rng = ChaCha8Rng::from_seed(self.seed);
        self.idx = 0;
    }
}

fn random_byte_set() -> Vec<Vec<u8>> {
    (0u8..=255).map(|b| vec![b]).collect()
}

fn alphabetic_set() -> Vec<Vec<u8>> {
    ASCII_ALPHABETICS.iter().map(|b| vec![*b]).collect()
}

fn syntax_set() -> Vec<Vec<u8>> {
    SYNTAX_TOKENS.iter().map(|t| t.to_vec()).collect()
}

fn surrogate_series() -> Vec<Vec<u8>> {
    BAD_SURROGATES.iter().map(|t| t.to_vec()).collect()
}

/// The stock 70/85/100 injection mix.
fn default_injection(max_len: usize, utf16: bool) -> ByteGen {
    let mix = MixAndMatch::new(
        max_len,
        vec![random_byte_set(), alphabetic_set(), syntax_set()],
        &[70, 85, 100],
        utf16,
        [0x11u8; 32],
    );
    if utf16 {
        let surrogates = Repeater::new(surrogate_series(), 1, 0, max_len.max(1), Vec::new());
        Box::new(Chain::new(vec![
            Box::new(mix) as ByteGen,
            Box::new(surrogates) as ByteGen,
        ]))
    } else {
        Box::new(mix)
    }
}

/// Emits every value of a sub-byte width as one byte, value in the low
/// bits so a left-truncating field assignment recovers it intact.
struct EnumerateBytes {
    next: u16,
    total: u16,
}

impl EnumerateBytes {
    fn new(width: usize) -> Self {
        debug_assert!(width <= 8);
        EnumerateBytes {
            next: 0,
            total: 1u16 << width,
        }
    }
}

impl Generator for EnumerateBytes {
    type Item = Vec<u8>;

    fn has_next(&self) -> bool {
        self.next < self.total
    }

    fn next_value(&mut self) -> Result<Vec<u8>, GeneratorError> {
        if !self.has_next() {
            return Err(GeneratorError::Exhausted);
        }
        let value = self.next as u8;
        self.next += 1;
        Ok(vec![value])
    }

    fn rewind(&mut self) {
        self.next = 0;
    }
}

/// The stock replacement strategy shared by every built-in kind.
fn default_replacement(
    field: &Field,
    max_len: usize,
    preserve_length: bool,
    random_cases: usize,
    fuzz_level: u32,
) -> ByteGen {
    let length = field.length_bits();
    let little = field.endianness() == Endianness::Little;
    let encoded = field.encode();

    if field.length_type() == LengthType::Fixed || max_len == 0 {
        if length > 8 {
            return Box::new(RollingCorrupt::new(
                &encoded,
                length,
                length,
                random_cases,
                little,
            ));
        }
        return Box::new(EnumerateBytes::new(length.max(1)));
    }

    // Variable-length fields: window sizes scale with the current content.
    let content_bits = field.bits().len().max(8);
    let mut chained: Vec<ByteGen> = Vec::new();
    if content_bits < 16 {
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 8, 8, random_cases, little,
        )));
    } else if content_bits < 32 {
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 16, 16, random_cases, little,
        )));
    } else {
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 16, 16, random_cases, little,
        )));
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 32, 32, random_cases, little,
        )));
    }
    if fuzz_level > 1 {
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 13, 5, random_cases, little,
        )));
        chained.push(Box::new(RollingCorrupt::new(
            &encoded, 7, 7, random_cases, little,
        )));
    }
    if !preserve_length {
        let reps = (max_len / encoded.len().max(1)).max(1);
        chained.push(Box::new(Repeater::new(
            vec![encoded.clone()],
            1,
            0,
            reps,
            Vec::new(),
        )));
        chained.push(Box::new(Chop::new(&encoded)));
    }
    Box::new(Chain::new(chained))
}

/// The built-in capability: stock injection and replacement chains.
pub struct DefaultMutations {
    utf16: bool,
}

impl DefaultMutations {
    pub fn new(utf16: bool) -> Self {
        DefaultMutations { utf16 }
    }
}

impl FieldMutations for DefaultMutations {
    fn injection(&self, max_len: usize) -> ByteGen {
        default_injection(max_len, self.utf16)
    }

    fn replacement(
        &self,
        field: &Field,
        max_len: usize,
        preserve_length: bool,
        random_cases: usize,
        fuzz_level: u32,
    ) -> ByteGen {
        default_replacement(field, max_len, preserve_length, random_cases, fuzz_level)
    }
}

/// String override: front-loads mostly-ASCII content before the stock mix.
pub struct StringMutations;

impl FieldMutations for StringMutations {
    fn injection(&self, max_len: usize) -> ByteGen {
        let ascii_heavy = MixAndMatch::new(
            max_len,
            vec![alphabetic_set(), random_byte_set(), syntax_set()],
            &[85, 95, 100],
            false,
            [0x22u8; 32],
        );
        Box::new(Chain::new(vec![
            Box::new(ascii_heavy) as ByteGen,
            default_injection(max_len, false),
        ]))
    }

    fn replacement(
        &self,
        field: &Field,
        max_len: usize,
        preserve_length: bool,
        random_cases: usize,
        fuzz_level: u32,
    ) -> ByteGen {
        default_replacement(field, max_len, preserve_length, random_cases, fuzz_level)
    }
}

/// Mutation capabilities keyed by field-kind tag.
///
/// Open for extension at runtime: registering a tag makes fields of that
/// kind fuzzable, including kinds the library has never heard of.
pub struct MutationRegistry {
    entries: HashMap<String, Box<dyn FieldMutations>>,
}

impl MutationRegistry {
    pub fn empty() -> Self {
        MutationRegistry {
            entries: HashMap::new(),
        }
    }

    /// A registry with the built-in kinds wired to the stock chains and the
    /// string kind to its ASCII-heavy override.
    pub fn with_defaults() -> Self {
        let mut registry = MutationRegistry::empty();
        for tag in ["unsigned", "signed", "hexstring", "octetstring", "bitstring"] {
            registry.register(tag, Box::new(DefaultMutations::new(false)));
        }
        registry.register("string", Box::new(StringMutations));
        registry
    }

    pub fn register(&mut self, tag: &str, capability: Box<dyn FieldMutations>) {
        self.entries.insert(tag.to_string(), capability);
    }

    pub fn capability(&self, tag: &str) -> Result<&dyn FieldMutations, MutationError> {
        self.entries
            .get(tag)
            .map(|b| b.as_ref())
            .ok_or_else(|| MutationError::UnknownKind(tag.to_string()))
    }
}

impl Default for MutationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A pure structure-to-structure rewrite applied after each mutation,
/// typically recomputing length and checksum fields.
pub type Fixup = Box<dyn Fn(&Binstruct) -> Binstruct + Send + Sync>;

/// Options controlling one `basic_tests` run.
pub struct FuzzOptions {
    /// Upper bound on injected/replicated content, in bytes.
    pub max_len: usize,
    /// Yield each mutation before the fixups as well as after.
    pub send_unfixed: bool,
    /// Suppress the first `skip` yields; counting still includes them.
    pub skip: u64,
    /// Depth multiplier for the default replacement chains.
    pub fuzz_level: u32,
    /// Never change the structure's serialized length.
    pub preserve_length: bool,
}

impl Default for FuzzOptions {
    fn default() -> Self {
        FuzzOptions {
            max_len: 128,
            send_unfixed: false,
            skip: 0,
            fuzz_level: 1,
            preserve_length: false,
        }
    }
}

/// Drives the per-field fuzz loop over a structure.
pub struct StructFuzzer<'r> {
    registry: &'r MutationRegistry,
    fixups: Vec<Fixup>,
}

impl<'r> StructFuzzer<'r> {
    pub fn new(registry: &'r MutationRegistry) -> Self {
        StructFuzzer {
            registry,
            fixups: Vec::new(),
        }
    }

    /// Appends a fixup; fixups run left-to-right on every yielded structure.
    pub fn push_fixup(&mut self, fixup: Fixup) {
        self.fixups.push(fixup);
    }

    /// Runs the replace, delete, inject and group phases over `structure`,
    /// yielding each mutated state and restoring the original afterwards.
    /// Returns the number of yields (suppressed ones included).
    pub fn basic_tests(
        &self,
        structure: &mut Binstruct,
        opts: &FuzzOptions,
        yield_fn: &mut dyn FnMut(&Binstruct),
    ) -> Result<u64, MutationError> {
        let original_wire = structure.encode();
        let mut emitted = 0u64;

        let mut emit = |s: &Binstruct, emitted: &mut u64| {
            if opts.send_unfixed {
                *emitted += 1;
                if *emitted > opts.skip {
                    yield_fn(s);
                }
            }
            let mut fixed = s.clone();
            for fixup in &self.fixups {
                fixed = fixup(&fixed);
            }
            *emitted += 1;
            if *emitted > opts.skip {
                yield_fn(&fixed);
            }
        };

        // Replace phase: substitute each leaf's raw bits, then verify the
        // restore left the wire image untouched.
        for name in structure.leaf_names() {
            let snapshot = structure
                .field(&name)
                .ok_or_else(|| MutationError::NoSuchField(name.clone()))?
                .clone();
            let saved = snapshot.bits().clone();
            let capability = self.registry.capability(snapshot.kind().tag())?;
            let mut gen = capability.replacement(
                &snapshot,
                opts.max_len,
                opts.preserve_length,
                4 * opts.fuzz_level as usize,
                opts.fuzz_level,
            );
            while gen.has_next() {
                let replacement = match gen.next_value() {
                    Ok(v) => v,
                    Err(_) => break,
                };
                let field = structure
                    .field_mut(&name)
                    .ok_or_else(|| MutationError::NoSuchField(name.clone()))?;
                field.set_raw(Bits::from_bytes(&replacement));
                emit(structure, &mut emitted);
            }
            structure
                .field_mut(&name)
                .ok_or_else(|| MutationError::NoSuchField(name.clone()))?
                .overwrite_bits(saved);
            if structure.encode() != original_wire {
                return Err(MutationError::RestoreInvariant { field: name });
            }
        }

        if !opts.preserve_length {
            // Delete phase: each leaf in turn becomes an empty substructure.
            for name in structure.leaf_names() {
                let placeholder = Node::Struct(Binstruct::new(&name, structure.endian()));
                let old = structure.replace(&name, placeholder)?;
                emit(structure, &mut emitted);
                structure.replace(&name, old)?;
            }

            // Inject phase: splice generator chunks before each leaf, and
            // after the first leaf as well.
            let leaf_names = structure.leaf_names();
            for (position, name) in leaf_names.iter().enumerate() {
                let snapshot = structure
                    .field(name)
                    .ok_or_else(|| MutationError::NoSuchField(name.clone()))?
                    .clone();
                let encoded = snapshot.encode();
                let capability = self.registry.capability(snapshot.kind().tag())?;
                let mut gen = capability.injection(opts.max_len);
                while gen.has_next() {
                    let chunk = match gen.next_value() {
                        Ok(v) => v,
                        Err(_) => break,
                    };

                    let mut spliced = chunk.clone();
                    spliced.extend_from_slice(&encoded);
                    let old = structure.replace(
                        name,
                        Node::Field(splice_field(name, &spliced, structure.endian())),
                    )?;
                    emit(structure, &mut emitted);

                    if position == 0 {
                        let mut appended = encoded.clone();
                        appended.extend_from_slice(&chunk);
                        structure.replace(
                            name,
                            Node::Field(splice_field(name, &appended, structure.endian())),
                        )?;
                        emit(structure, &mut emitted);
                    }
                    structure.replace(name, old)?;
                }
            }
        }

        // Group phase: cartesian product of the members' replacement
        // generators, every member reassigned per tuple.
        let groups = structure.groups().clone();
        for members in groups.values() {
            let mut gens: Vec<ByteGen> = Vec::with_capacity(members.len());
            let mut saved: Vec<(String, Bits)> = Vec::with_capacity(members.len());
            for member in members {
                let snapshot = structure
                    .field(member)
                    .ok_or_else(|| MutationError::NoSuchField(member.clone()))?
                    .clone();
                saved.push((member.clone(), snapshot.bits().clone()));
                let capability = self.registry.capability(snapshot.kind().tag())?;
                gens.push(capability.replacement(
                    &snapshot,
                    opts.max_len,
                    true,
                    8 * opts.fuzz_level as usize,
                    opts.fuzz_level,
                ));
            }
            let mut product = crate::generator::Cartesian::new(gens);
            while product.has_next() {
                let tuple = match product.next_value() {
                    Ok(v) => v,
                    Err(_) => break,
                };
                for (member, value) in members.iter().zip(tuple.iter()) {
                    structure
                        .field_mut(member)
                        .ok_or_else(|| MutationError::NoSuchField(member.clone()))?
                        .set_raw(Bits::from_bytes(value));
                }
                emit(structure, &mut emitted);
            }
            for (member, bits) in saved {
                structure
                    .field_mut(&member)
                    .ok_or_else(|| MutationError::NoSuchField(member))?
                    .overwrite_bits(bits);
            }
        }

        Ok(emitted)
    }

    /// The number of structures `basic_tests` would yield, without running
    /// the caller's body.
    pub fn count_tests(
        &self,
        structure: &mut Binstruct,
        opts: &FuzzOptions,
    ) -> Result<u64, MutationError> {
        self.basic_tests(structure, opts, &mut |_s| {})
    }
}

/// A variable string field sized to exactly the spliced content.
fn splice_field(name: &str, content: &[u8], endian: Endianness) -> Field {
    let mut field = Field::new(name, FieldKind::Str, content.len() * 8, endian)
        .expect("string fields accept any byte length");
    field
        .set_bytes(content)
        .expect("content length matches the declared width");
    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::collect_all;

    fn tiny_struct() -> Binstruct {
        let mut s = Binstruct::new("msg", Endianness::Big);
        s.unsigned("op", 4).unwrap();
        s.unsigned("flags", 4).unwrap();
        s.string("body", 32).unwrap();
        s.field_mut("op").unwrap().set_int(3).unwrap();
        s.field_mut("flags").unwrap().set_int(1).unwrap();
        s.field_mut("body").unwrap().set_bytes(b"hi").unwrap();
        s
    }

    #[test]
    fn mix_and_match_respects_max_len_progression() {
        let mut gen = MixAndMatch::new(
            32,
            vec![alphabetic_set(), syntax_set()],
            &[80, 100],
            false,
            [3u8; 32],
        );
        let values = collect_all(&mut gen);
        assert!(!values.is_empty());
        // Lengths grow towards the limit; the last emission reaches it.
        assert!(values.last().unwrap().len() >= 32);
        gen.rewind();
        assert_eq!(collect_all(&mut gen), values);
    }

    #[test]
    fn mix_and_match_utf16_emits_even_lengths() {
        let mut gen = MixAndMatch::new(
            17,
            vec![alphabetic_set()],
            &[100],
            true,
            [4u8; 32],
        );
        for value in collect_all(&mut gen) {
            assert_eq!(value.len() % 2, 0, "UTF-16 output must stay aligned");
        }
    }

    #[test]
    fn default_replacement_enumerates_small_fixed_fields() {
        let field = Field::new("op", FieldKind::Unsigned, 4, Endianness::Big).unwrap();
        let mut gen = default_replacement(&field, 64, false, 0, 1);
        let values = collect_all(&mut gen);
        assert_eq!(values.len(), 16);
        assert_eq!(values[0], vec![0x00]);
        assert_eq!(values[15], vec![0x0F]);
    }

    #[test]
    fn default_replacement_rolls_wide_fixed_fields() {
        let mut field = Field::new("len", FieldKind::Unsigned, 16, Endianness::Big).unwrap();
        field.set_int(0x4142).unwrap();
        let mut gen = default_replacement(&field, 64, false, 0, 1);
        let first = gen.next_value().unwrap();
        assert_eq!(first, vec![0x41, 0x43]);
        for value in collect_all(&mut gen) {
            assert_eq!(value.len(), 2);
        }
    }

    #[test]
    fn default_replacement_variable_extends_and_shrinks() {
        let mut field = Field::new("body", FieldKind::Str, 256, Endianness::Big).unwrap();
        field.set_bytes(b"abcd").unwrap();
        let mut gen = default_replacement(&field, 16, false, 0, 1);
        let values = collect_all(&mut gen);
        assert!(values.iter().any(|v| v.len() > 4), "repeater grows content");
        assert!(values.iter().any(|v| v.len() < 4), "chop shrinks content");

        let mut preserved = default_replacement(&field, 16, true, 0, 1);
        for value in collect_all(&mut preserved) {
            assert_eq!(value.len(), 4, "preserve_length keeps the width");
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = MutationRegistry::with_defaults();
        assert!(matches!(
            registry.capability("exotic"),
            Err(MutationError::UnknownKind(_))
        ));

        let mut extended = MutationRegistry::with_defaults();
        extended.register("exotic", Box::new(DefaultMutations::new(false)));
        assert!(extended.capability("exotic").is_ok());
    }

    #[test]
    fn basic_tests_restores_the_original_wire_image() {
        let registry = MutationRegistry::with_defaults();
        let fuzzer = StructFuzzer::new(&registry);
        let mut s = tiny_struct();
        let before = s.encode();

        let opts = FuzzOptions {
            max_len: 8,
            ..FuzzOptions::default()
        };
        let mut yields = 0u64;
        let count = fuzzer
            .basic_tests(&mut s, &opts, &mut |_s| yields += 1)
            .unwrap();
        assert_eq!(s.encode(), before, "structure must be restored");
        assert_eq!(count, yields);
        assert!(count > 0);
    }

    #[test]
    fn count_tests_matches_a_counting_run() {
        let registry = MutationRegistry::with_defaults();
        let fuzzer = StructFuzzer::new(&registry);
        let opts = FuzzOptions {
            max_len: 8,
            ..FuzzOptions::default()
        };

        let mut s = tiny_struct();
        let counted = fuzzer.count_tests(&mut s, &opts).unwrap();

        let mut s2 = tiny_struct();
        let mut yields = 0u64;
        fuzzer
            .basic_tests(&mut s2, &opts, &mut |_s| yields += 1)
            .unwrap();
        assert_eq!(counted, yields);
    }

    #[test]
    fn skip_suppresses_early_yields_but_not_the_count() {
        let registry = MutationRegistry::with_defaults();
        let fuzzer = StructFuzzer::new(&registry);
        let mut s = tiny_struct();
        let full = fuzzer
            .count_tests(&mut s, &FuzzOptions { max_len: 8, ..FuzzOptions::default() })
            .unwrap();

        let mut s2 = tiny_struct();
        let opts = FuzzOptions {
            max_len: 8,
            skip: 10,
            ..FuzzOptions::default()
        };
        let mut yields = 0u64;
        let count = fuzzer
            .basic_tests(&mut s2, &opts, &mut |_s| yields += 1)
            .unwrap();
        assert_eq!(count, full);
        assert_eq!(yields, full - 10);
    }

    #[test]
    fn send_unfixed_doubles_the_yields() {
        let registry = MutationRegistry::with_defaults();
        let fuzzer = StructFuzzer::new(&registry);
        let opts = FuzzOptions {
            max_len: 8,
            ..FuzzOptions::default()
        };
        let mut s = tiny_struct();
        let fixed_only = fuzzer.count_tests(&mut s, &opts).unwrap();

        let mut s2 = tiny_struct();
        let opts_unfixed = FuzzOptions {
            max_len: 8,
            send_unfixed: true,
            ..FuzzOptions::default()
        };
        let both = fuzzer.count_tests(&mut s2, &opts_unfixed).unwrap();
        assert_eq!(both, fixed_only * 2);
    }

    #[test]
    fn fixups_are_applied_left_to_right() {
        let registry = MutationRegistry::with_defaults();
        let mut fuzzer = StructFuzzer::new(&registry);
        fuzzer.push_fixup(Box::new(|s: &Binstruct| {
            let mut fixed = s.clone();
            if let Some(f) = fixed.field_mut("op") {
                let _ = f.set_int(0xF);
            }
            fixed
        }));

        let mut s = tiny_struct();
        let opts = FuzzOptions {
            max_len: 8,
            ..FuzzOptions::default()
        };
        let mut saw_fixed = false;
        fuzzer
            .basic_tests(&mut s, &opts, &mut |m| {
                if let Some(f) = m.field("op") {
                    if f.get_uint().unwrap_or(0) == 0xF {
                        saw_fixed = true;
                    }
                }
            })
            .unwrap();
        assert!(saw_fixed, "fixup output must be yielded");
    }

    #[test]
    fn group_phase_sweeps_member_products() {
        let registry = MutationRegistry::with_defaults();
        let fuzzer = StructFuzzer::new(&registry);
        let mut s = Binstruct::new("pair", Endianness::Big);
        s.unsigned("a", 2).unwrap();
        s.unsigned("b", 2).unwrap();
        s.group("ab", &["a", "b"]).unwrap();

        let opts = FuzzOptions {
            max_len: 0,
            preserve_length: true,
            ..FuzzOptions::default()
        };
        // preserve_length skips delete/inject; replace yields 4 per field,
        // the group yields the 4x4 product.
        let count = fuzzer.count_tests(&mut s, &opts).unwrap();
        assert_eq!(count, 4 + 4 + 16);
    }
}
