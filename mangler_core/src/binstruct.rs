use crate::bits::Bits;
use crate::field::{Endianness, Field, FieldError, FieldKind, LengthType};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while building or reshaping a structure.
#[derive(Error, Debug)]
pub enum BinstructError {
    /// Field and structure names must be unique within the whole tree.
    #[error("duplicate name '{0}' in structure")]
    DuplicateName(String),

    /// A group member or traversal target does not name an existing field.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error(transparent)]
    Field(#[from] FieldError),
}

/// A node of the structure tree: a leaf field or a nested structure.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Field(Field),
    Struct(Binstruct),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Field(f) => f.name(),
            Node::Struct(s) => s.name(),
        }
    }
}

/// An ordered sequence of typed bit fields and nested structures.
///
/// Construction is declarative: a structure names its default endianness and
/// then declares fields in wire order. Serialization concatenates child bit
/// strings in declaration order, padding the result to a byte boundary on
/// the right; bitfield containers additionally byte-swap their assembled
/// content when little-endian.
///
/// Names are unique across the whole tree and group declarations store
/// names rather than references, so the tree is strictly downward and
/// lookups go through [`Binstruct::field`] / [`Binstruct::field_mut`].
#[derive(Debug, Clone, PartialEq)]
pub struct Binstruct {
    name: String,
    endian: Endianness,
    bitfield: bool,
    children: Vec<Node>,
    groups: BTreeMap<String, Vec<String>>,
}

impl Binstruct {
    pub fn new(name: &str, endian: Endianness) -> Self {
        Binstruct {
            name: name.to_string(),
            endian,
            bitfield: false,
            children: Vec::new(),
            groups: BTreeMap::new(),
        }
    }

    /// A bitfield: an invisible container for sub-byte fields that is
    /// byte-swapped on serialization when little-endian.
    pub fn new_bitfield(name: &str, endian: Endianness) -> Self {
        let mut s = Binstruct::new(name, endian);
        s.bitfield = true;
        s
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn is_bitfield(&self) -> bool {
        self.bitfield
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.groups
    }

    fn collect_names<'a>(&'a self, out: &mut Vec<&'a str>) {
        for child in &self.children {
            match child {
                Node::Field(f) => out.push(f.name()),
                Node::Struct(s) => {
                    out.push(s.name());
                    s.collect_names(out);
                }
            }
        }
    }

    fn check_new_name(&self, name: &str) -> Result<(), BinstructError> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        if names.contains(&name) || name == self.name {
            return Err(BinstructError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    pub fn push_field(&mut self, field: Field) -> Result<(), BinstructError> {
        self.check_new_name(field.name())?;
        self.children.push(Node::Field(field));
        Ok(())
    }

    pub fn push_struct(&mut self, child: Binstruct) -> Result<(), BinstructError> {
        self.check_new_name(child.name())?;
        let mut inner = Vec::new();
        child.collect_names(&mut inner);
        for name in inner {
            self.check_new_name(name)?;
        }
        self.children.push(Node::Struct(child));
        Ok(())
    }

    pub fn unsigned(&mut self, name: &str, length_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::Unsigned, length_bits, self.endian)?)
    }

    pub fn signed(&mut self, name: &str, length_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::Signed, length_bits, self.endian)?)
    }

    pub fn string(&mut self, name: &str, max_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::Str, max_bits, self.endian)?)
    }

    pub fn hexstring(&mut self, name: &str, max_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::HexStr, max_bits, self.endian)?)
    }

    pub fn octetstring(&mut self, name: &str, length_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::OctetStr, length_bits, self.endian)?)
    }

    pub fn bitstring(&mut self, name: &str, length_bits: usize) -> Result<(), BinstructError> {
        self.push_field(Field::new(name, FieldKind::BitStr, length_bits, self.endian)?)
    }

    /// Declares a named group over existing fields; the fuzzer exhausts the
    /// cartesian product of the members' replacement generators.
    pub fn group(&mut self, name: &str, members: &[&str]) -> Result<(), BinstructError> {
        for member in members {
            if self.field(member).is_none() {
                return Err(BinstructError::UnknownField(member.to_string()));
            }
        }
        self.groups.insert(
            name.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
        Ok(())
    }

    /// Total content width in bits, before byte padding.
    pub fn bit_len(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                Node::Field(f) => f.bits().len(),
                Node::Struct(s) => s.bit_len(),
            })
            .sum()
    }

    fn assemble(&self) -> Bits {
        let mut out = Bits::new();
        for child in &self.children {
            match child {
                Node::Field(f) => out.extend(f.bits()),
                Node::Struct(s) => {
                    let mut inner = s.assemble();
                    if s.bitfield && s.endian == Endianness::Little && inner.len() % 8 == 0 {
                        inner = inner.swap_bytes();
                    }
                    out.extend(&inner);
                }
            }
        }
        out
    }

    /// Serializes to bytes, padding right with zeros to a byte boundary.
    ///
    /// Non-byte-aligned structures are permitted; content past the last
    /// whole byte is undefined on the wire and zero-filled here.
    pub fn encode(&self) -> Vec<u8> {
        self.assemble().to_bytes()
    }

    /// Populates every field by consuming bits from `bytes` in declaration
    /// order. Round-trips with [`Binstruct::encode`] for byte-aligned
    /// structures.
    pub fn decode(&mut self, bytes: &[u8]) {
        let bits = Bits::from_bytes(bytes);
        let mut cursor = 0usize;
        self.consume(&bits, &mut cursor);
    }

    fn consume(&mut self, source: &Bits, cursor: &mut usize) {
        // Split borrows: bitfield handling needs self fields while children
        // are walked, so take the flags up front.
        let swap = self.bitfield && self.endian == Endianness::Little;
        if swap {
            let span = self.declared_bit_len();
            if span % 8 == 0 {
                let window = source.slice(*cursor, *cursor + span).swap_bytes();
                let mut local = 0usize;
                for child in &mut self.children {
                    Self::consume_child(child, &window, &mut local);
                }
                *cursor += span;
                return;
            }
        }
        for child in &mut self.children {
            Self::consume_child(child, source, cursor);
        }
    }

    fn consume_child(child: &mut Node, source: &Bits, cursor: &mut usize) {
        match child {
            Node::Field(f) => f.consume(source, cursor),
            Node::Struct(s) => s.consume(source, cursor),
        }
    }

    /// Declared width of the structure: fixed fields contribute their
    /// declared length, variable fields their current content length.
    fn declared_bit_len(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                Node::Field(f) => match f.length_type() {
                    LengthType::Fixed => f.length_bits(),
                    LengthType::Variable => f.bits().len(),
                },
                Node::Struct(s) => s.declared_bit_len(),
            })
            .sum()
    }

    /// Yields every field one level deep, descending into bitfields but not
    /// into nested structures.
    pub fn each(&self) -> Vec<&Field> {
        let mut out = Vec::new();
        for child in &self.children {
            match child {
                Node::Field(f) => out.push(f),
                Node::Struct(s) if s.bitfield => {
                    for inner in &s.children {
                        if let Node::Field(f) = inner {
                            out.push(f);
                        }
                    }
                }
                Node::Struct(_) => {}
            }
        }
        out
    }

    /// Yields every leaf field across all nesting, in wire order.
    pub fn flatten(&self) -> Vec<&Field> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a Field>) {
        for child in &self.children {
            match child {
                Node::Field(f) => out.push(f),
                Node::Struct(s) => s.flatten_into(out),
            }
        }
    }

    /// Names of every leaf field, in wire order. The fuzz driver iterates
    /// these so it can hold mutable access to one field at a time.
    pub fn leaf_names(&self) -> Vec<String> {
        self.flatten().iter().map(|f| f.name().to_string()).collect()
    }

    /// Deep lookup of a leaf field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        for child in &self.children {
            match child {
                Node::Field(f) if f.name() == name => return Some(f),
                Node::Field(_) => {}
                Node::Struct(s) => {
                    if let Some(found) = s.field(name) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        for child in &mut self.children {
            match child {
                Node::Field(f) if f.name() == name => return Some(f),
                Node::Field(_) => {}
                Node::Struct(s) => {
                    if let Some(found) = s.field_mut(name) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Substitutes the node called `name` anywhere in the tree, returning
    /// the displaced node so the caller can restore it later. The
    /// replacement should carry the same name to preserve lookups.
    pub fn replace(&mut self, name: &str, replacement: Node) -> Result<Node, BinstructError> {
        self.replace_inner(name, replacement)
            .map_err(|_| BinstructError::UnknownField(name.to_string()))
    }

    fn replace_inner(&mut self, name: &str, replacement: Node) -> Result<Node, Node> {
        let mut replacement = replacement;
        for child in &mut self.children {
            if child.name() == name {
                return Ok(std::mem::replace(child, replacement));
            }
            if let Node::Struct(s) = child {
                match s.replace_inner(name, replacement) {
                    Ok(old) => return Ok(old),
                    Err(back) => replacement = back,
                }
            }
        }
        Err(replacement)
    }
}
