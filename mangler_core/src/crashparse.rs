//! Stateless extraction of structured crash details from debugger text.
//!
//! Every extractor locates a labelled region of the raw output and returns
//! empty/default content when the label is absent; nothing here fails on
//! malformed input.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// A module reported loaded in the target at crash time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadedModule {
    /// Whether private symbols were available (the status mentions a pdb).
    pub syms_loaded: bool,
    pub name: String,
    pub size: Option<u64>,
    pub timestamp: String,
    pub version: String,
    pub checksum: String,
}

/// The normalised form of one crash's debugger output.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CrashDetail {
    /// `(index, frame text)` in file order.
    pub stack_frames: Vec<(u32, String)>,
    /// Keyed by module base address.
    pub loaded_modules: BTreeMap<u64, LoadedModule>,
    /// Register name to value, from the last register block in the text.
    pub registers: BTreeMap<String, u64>,
    /// `(index, instruction text)` in file order.
    pub disassembly: Vec<(u32, String)>,
    pub classification: String,
    pub exception_type: String,
    pub exception_subtype: String,
    pub short_desc: String,
    pub long_desc: String,
    pub bug_title: String,
    /// `major.minor`, or the `Hash=` fallback, or empty.
    pub hash: String,
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid extraction pattern"))
}

/// Runs every extractor over the raw text.
pub fn parse(text: &str) -> CrashDetail {
    CrashDetail {
        stack_frames: stack_trace(text),
        loaded_modules: loaded_modules(text),
        registers: registers(text),
        disassembly: disassembly(text),
        classification: labelled_tail(text, "CLASSIFICATION"),
        exception_type: labelled_tail(text, "EXCEPTION_TYPE"),
        exception_subtype: labelled_tail(text, "EXCEPTION_SUBTYPE"),
        short_desc: labelled_tail(text, "SHORT_DESCRIPTION"),
        long_desc: labelled_tail(text, "LONG_DESCRIPTION"),
        bug_title: labelled_tail(text, "BUG_TITLE"),
        hash: hash(text),
    }
}

/// Enumerates `STACK_FRAME:<text>` lines in file order.
pub fn stack_trace(text: &str) -> Vec<(u32, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r"(?m)^STACK_FRAME:(.*)$");
    re.captures_iter(text)
        .enumerate()
        .map(|(i, cap)| (i as u32, cap[1].trim().to_string()))
        .collect()
}

/// Enumerates `BASIC_BLOCK_INSTRUCTION:<text>` lines in file order.
pub fn disassembly(text: &str) -> Vec<(u32, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r"(?m)^BASIC_BLOCK_INSTRUCTION:(.*)$");
    re.captures_iter(text)
        .enumerate()
        .map(|(i, cap)| (i as u32, cap[1].trim().to_string()))
        .collect()
}

/// Reads the tail of the single `LABEL:<text>` line, empty when absent.
pub fn labelled_tail(text: &str, label: &str) -> String {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(label) {
            if let Some(tail) = rest.strip_prefix(':') {
                return tail.trim().to_string();
            }
        }
    }
    String::new()
}

/// Concatenates `MAJOR_HASH` and `MINOR_HASH` as `major.minor`, falling
/// back to a `Hash=<value>` pattern, else empty.
pub fn hash(text: &str) -> String {
    let major = labelled_tail(text, "MAJOR_HASH");
    let minor = labelled_tail(text, "MINOR_HASH");
    if !major.is_empty() || !minor.is_empty() {
        return format!("{major}.{minor}");
    }
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(&RE, r"Hash=(\S+)");
    re.captures(text)
        .map(|cap| cap[1].to_string())
        .unwrap_or_default()
}

/// Parses module list blocks.
///
/// A block opens with a header of two eight-digit hex addresses, the module
/// alias and its symbol status, followed by indented `key: value` lines up
/// to the next header. Only entries carrying an `Image name` are kept;
/// `syms_loaded` is true when the status mentions a pdb.
pub fn loaded_modules(text: &str) -> BTreeMap<u64, LoadedModule> {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static KEYVAL: OnceLock<Regex> = OnceLock::new();
    let header = regex(
        &HEADER,
        r"^([0-9a-f]{8})\s+([0-9a-f]{8})\s+\S+\s+\((.*?)\)",
    );
    let keyval = regex(&KEYVAL, r"^\s+([A-Za-z ]+):\s*(.*)$");

    let mut modules = BTreeMap::new();
    let mut current: Option<(u64, String, BTreeMap<String, String>)> = None;

    let mut finish = |entry: Option<(u64, String, BTreeMap<String, String>)>,
                      modules: &mut BTreeMap<u64, LoadedModule>| {
        let Some((base, status, keys)) = entry else {
            return;
        };
        let Some(name) = keys.get("Image name") else {
            return;
        };
        modules.insert(
            base,
            LoadedModule {
                syms_loaded: status.contains("pdb"),
                name: name.clone(),
                size: keys
                    .get("ImageSize")
                    .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()),
                timestamp: keys.get("Timestamp").cloned().unwrap_or_default(),
                version: keys.get("File version").cloned().unwrap_or_default(),
                checksum: keys.get("CheckSum").cloned().unwrap_or_default(),
            },
        );
    };

    for line in text.lines() {
        if let Some(cap) = header.captures(line) {
            finish(current.take(), &mut modules);
            if let Ok(base) = u64::from_str_radix(&cap[1], 16) {
                current = Some((base, cap[3].to_string(), BTreeMap::new()));
            }
        } else if let Some((_, _, keys)) = current.as_mut() {
            if let Some(cap) = keyval.captures(line) {
                keys.insert(cap[1].trim().to_string(), cap[2].trim().to_string());
            }
        }
    }
    finish(current.take(), &mut modules);
    modules
}

/// Extracts the last register block, `eax` through `iopl`.
pub fn registers(text: &str) -> BTreeMap<String, u64> {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    let pair = regex(&PAIR, r"\b(e[a-z]{2})=([0-9a-f]{8})\b");

    let Some(block_start) = text.rfind("eax=") else {
        return BTreeMap::new();
    };
    let block = &text[block_start..];
    let block_end = block.find("iopl").map(|i| i + 4).unwrap_or(block.len());

    let mut out = BTreeMap::new();
    for cap in pair.captures_iter(&block[..block_end]) {
        if let Ok(value) = u64::from_str_radix(&cap[2], 16) {
            out.insert(cap[1].to_string(), value);
        }
    }
    out
}

/// Splits a frame like `module!function+0x1f` into its parts; frames that
/// do not follow the pattern come back as `(None, None, None)`.
pub fn split_frame(frame: &str) -> (Option<String>, Option<String>, Option<u64>) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = regex(
        &RE,
        r"^([A-Za-z0-9_.]+)!([A-Za-z0-9_:<>~@$]+)(?:\+0x([0-9a-fA-F]+))?",
    );
    match re.captures(frame.trim()) {
        Some(cap) => {
            let module = Some(cap[1].to_string());
            let func_name = Some(cap[2].to_string());
            let offset = cap
                .get(3)
                .and_then(|m| u64::from_str_radix(m.as_str(), 16).ok());
            (module, func_name, offset)
        }
        None => (None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
EXCEPTION_TYPE:STATUS_ACCESS_VIOLATION
EXCEPTION_SUBTYPE:READ
CLASSIFICATION:EXPLOITABLE
SHORT_DESCRIPTION:Read Access Violation
LONG_DESCRIPTION:Read access violation near null
BUG_TITLE:Exploitable - Read Access Violation starting at target!parse_header
MAJOR_HASH:0x1a2b3c4d
MINOR_HASH:0x5e6f7a8b
STACK_FRAME:target!parse_header+0x1f
STACK_FRAME:target!dispatch+0x40
STACK_FRAME:kernel32!BaseThreadInitThunk+0x12
BASIC_BLOCK_INSTRUCTION:mov eax, dword ptr [ecx]
BASIC_BLOCK_INSTRUCTION:test eax, eax
00400000 00410000   target     (deferred)
    Image path: C:\\victim\\target.exe
    Image name: target.exe
    Timestamp: Mon Apr  1 12:00:00 2024
    CheckSum: 0001a2b3
    ImageSize: 00010000
    File version: 1.2.3.4
10000000 10020000   helper     (pdb symbols)
    Image name: helper.dll
    CheckSum: 000052aa
    ImageSize: 00020000
77000000 77100000   unnamed    (export symbols)
    Timestamp: unavailable
eax=00000001 ebx=7ffd9000 ecx=00000000 edx=00000002 esi=0012f744 edi=0012f7a0
eip=00401021 esp=0012f680 ebp=0012f6c8 iopl=0         nv up ei pl zr na pe nc
";

    #[test]
    fn stack_trace_enumerates_frames_in_order() {
        let frames = stack_trace(SAMPLE);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], (0, "target!parse_header+0x1f".to_string()));
        assert_eq!(frames[2].0, 2);
        assert!(stack_trace("no frames here").is_empty());
    }

    #[test]
    fn loaded_modules_keeps_image_name_entries_only() {
        let modules = loaded_modules(SAMPLE);
        assert_eq!(modules.len(), 2, "the unnamed block must be dropped");

        let target = &modules[&0x0040_0000];
        assert_eq!(target.name, "target.exe");
        assert!(!target.syms_loaded);
        assert_eq!(target.size, Some(0x10000));
        assert_eq!(target.version, "1.2.3.4");
        assert_eq!(target.checksum, "0001a2b3");

        let helper = &modules[&0x1000_0000];
        assert!(helper.syms_loaded, "pdb status means symbols loaded");
    }

    #[test]
    fn registers_come_from_the_last_block() {
        let regs = registers(SAMPLE);
        assert_eq!(regs["eax"], 1);
        assert_eq!(regs["eip"], 0x0040_1021);
        assert_eq!(regs["esp"], 0x0012_f680);
        assert!(registers("nothing to see").is_empty());

        let two_blocks = format!("{SAMPLE}\neax=000000ff ebx=00000000 iopl=0\n");
        assert_eq!(registers(&two_blocks)["eax"], 0xFF);
    }

    #[test]
    fn disassembly_enumerates_instructions() {
        let instrs = disassembly(SAMPLE);
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].1, "mov eax, dword ptr [ecx]");
    }

    #[test]
    fn labelled_tails_default_to_empty() {
        assert_eq!(labelled_tail(SAMPLE, "EXCEPTION_TYPE"), "STATUS_ACCESS_VIOLATION");
        assert_eq!(labelled_tail(SAMPLE, "CLASSIFICATION"), "EXPLOITABLE");
        assert_eq!(labelled_tail(SAMPLE, "NOT_A_LABEL"), "");
    }

    #[test]
    fn hash_prefers_major_minor_then_falls_back() {
        assert_eq!(hash(SAMPLE), "0x1a2b3c4d.0x5e6f7a8b");
        assert_eq!(hash("... Hash=deadbeef ..."), "deadbeef");
        assert_eq!(hash("nothing"), "");
        assert_eq!(hash("EXCEPTION_TYPE:X\nMAJOR_HASH:a\nMINOR_HASH:b\n"), "a.b");
    }

    #[test]
    fn split_frame_handles_offsets_and_garbage() {
        assert_eq!(
            split_frame("target!parse_header+0x1f"),
            (
                Some("target".to_string()),
                Some("parse_header".to_string()),
                Some(0x1f)
            )
        );
        assert_eq!(
            split_frame("kernel32!BaseThreadInitThunk"),
            (
                Some("kernel32".to_string()),
                Some("BaseThreadInitThunk".to_string()),
                None
            )
        );
        assert_eq!(split_frame("0x00401021"), (None, None, None));
    }

    #[test]
    fn parse_populates_every_section() {
        let detail = parse(SAMPLE);
        assert_eq!(detail.exception_type, "STATUS_ACCESS_VIOLATION");
        assert_eq!(detail.exception_subtype, "READ");
        assert_eq!(detail.stack_frames.len(), 3);
        assert_eq!(detail.loaded_modules.len(), 2);
        assert_eq!(detail.disassembly.len(), 2);
        assert_eq!(detail.hash, "0x1a2b3c4d.0x5e6f7a8b");
        assert!(detail.bug_title.starts_with("Exploitable"));

        let empty = parse("");
        assert_eq!(empty, CrashDetail::default());
    }
}
