//! Flattened device-tree codec and bootargs patcher.
//!
//! The blob is decoded into a tagged node/property tree, the property is
//! inserted structurally, and the tree is re-encoded. No round-trip through
//! `dtc` or the text form, so no external compiler is needed. Only what the
//! single insertion pattern requires is implemented; this is not a general
//! device-tree compiler.

use std::collections::HashMap;

use crate::error::HarnessError;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 0x0000_0001;
const FDT_END_NODE: u32 = 0x0000_0002;
const FDT_PROP: u32 = 0x0000_0003;
const FDT_NOP: u32 = 0x0000_0004;
const FDT_END: u32 = 0x0000_0009;

const HEADER_BYTES: usize = 40;
const SUPPORTED_VERSION: u32 = 17;
const LAST_COMP_VERSION: u32 = 16;

/// One property: name plus opaque value bytes (strings carry a trailing NUL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub name: String,
    pub value: Vec<u8>,
}

/// A device-tree node: named properties plus ordered children.
/// Decoding enforces that a node never holds two properties of the same name.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub properties: Vec<Property>,
    pub children: Vec<Node>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_slice())
    }

    /// Property value as a string, trailing NUL stripped.
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(|v| {
            let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
            std::str::from_utf8(&v[..end]).ok()
        })
    }

    /// Set a string property, replacing any existing value.
    pub fn set_property_str(&mut self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        if let Some(prop) = self.properties.iter_mut().find(|p| p.name == name) {
            prop.value = bytes;
        } else {
            self.properties.push(Property {
                name: name.to_string(),
                value: bytes,
            });
        }
    }

    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Depth-first search for a node with the given name (unit address
    /// included, e.g. `memory@40000000`).
    pub fn find_named(&self, name: &str) -> Option<&Node> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_named(name))
    }

    pub fn find_named_mut(&mut self, name: &str) -> Option<&mut Node> {
        if self.name == name {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|c| c.find_named_mut(name))
    }
}

/// A decoded device tree: the node tree plus the header fields and memory
/// reservations that must survive re-encoding. Transient: derived from a
/// dumped blob and discarded after re-encoding.
#[derive(Debug, Clone)]
pub struct DeviceTree {
    pub root: Node,
    boot_cpuid: u32,
    reservations: Vec<(u64, u64)>,
}

impl DeviceTree {
    /// Decode a binary blob into the tree form.
    pub fn decode(blob: &[u8]) -> Result<Self, HarnessError> {
        let mut r = Reader { blob, pos: 0 };
        if blob.len() < HEADER_BYTES {
            return Err(decode_err(format!(
                "blob of {} bytes is shorter than the {}-byte header",
                blob.len(),
                HEADER_BYTES
            )));
        }
        if r.u32_at(0)? != FDT_MAGIC {
            return Err(decode_err("bad magic".into()));
        }
        let totalsize = r.u32_at(4)? as usize;
        if totalsize > blob.len() {
            return Err(decode_err(format!(
                "header claims {} bytes but blob holds {}",
                totalsize,
                blob.len()
            )));
        }
        let off_struct = r.u32_at(8)? as usize;
        let off_strings = r.u32_at(12)? as usize;
        let off_rsvmap = r.u32_at(16)? as usize;
        let version = r.u32_at(20)?;
        if version < LAST_COMP_VERSION {
            return Err(decode_err(format!("unsupported version {}", version)));
        }
        let boot_cpuid = r.u32_at(28)?;

        // Memory reservation block: (address, size) pairs ending at (0, 0).
        let mut reservations = Vec::new();
        let mut pos = off_rsvmap;
        loop {
            let address = r.u64_at(pos)?;
            let size = r.u64_at(pos + 8)?;
            if address == 0 && size == 0 {
                break;
            }
            reservations.push((address, size));
            pos += 16;
        }

        r.pos = off_struct;
        loop {
            match r.read_u32()? {
                FDT_NOP => continue,
                FDT_BEGIN_NODE => break,
                other => {
                    return Err(decode_err(format!(
                        "expected root BEGIN_NODE, found tag 0x{:08x}",
                        other
                    )))
                }
            }
        }
        let root = r.read_node(off_strings)?;

        Ok(Self {
            root,
            boot_cpuid,
            reservations,
        })
    }

    /// Re-encode the tree as a version-17 blob.
    pub fn encode(&self) -> Result<Vec<u8>, HarnessError> {
        let mut w = Writer {
            structure: Vec::new(),
            strings: Vec::new(),
            interned: HashMap::new(),
        };
        w.write_node(&self.root)?;
        w.structure.extend_from_slice(&FDT_END.to_be_bytes());

        let rsvmap_len = (self.reservations.len() + 1) * 16;
        let off_rsvmap = HEADER_BYTES;
        let off_struct = off_rsvmap + rsvmap_len;
        let off_strings = off_struct + w.structure.len();
        let totalsize = (off_strings + w.strings.len() + 3) & !3;

        let mut out = Vec::with_capacity(totalsize);
        for field in [
            FDT_MAGIC,
            totalsize as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            SUPPORTED_VERSION,
            LAST_COMP_VERSION,
            self.boot_cpuid,
            w.strings.len() as u32,
            w.structure.len() as u32,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        for (address, size) in &self.reservations {
            out.extend_from_slice(&address.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&w.structure);
        out.extend_from_slice(&w.strings);
        out.resize(totalsize, 0);
        Ok(out)
    }
}

/// Insert `bootargs = "<bootargs>";` as the first property of the `chosen`
/// node and return the re-encoded blob. The input blob is never mutated.
///
/// Fails with [`HarnessError::BootargsAlreadyPresent`] if the node already
/// defines the property; overwriting boot parameters is a caller decision.
pub fn patch_bootargs(blob: &[u8], bootargs: &str) -> Result<Vec<u8>, HarnessError> {
    let mut tree = DeviceTree::decode(blob)?;
    let chosen = tree
        .root
        .find_named_mut("chosen")
        .ok_or(HarnessError::ChosenNodeMissing)?;
    if chosen.property("bootargs").is_some() {
        return Err(HarnessError::BootargsAlreadyPresent);
    }
    let mut value = bootargs.as_bytes().to_vec();
    value.push(0);
    chosen.properties.insert(
        0,
        Property {
            name: "bootargs".to_string(),
            value,
        },
    );
    tree.encode()
}

fn decode_err(detail: String) -> HarnessError {
    HarnessError::DecodeError(detail)
}

struct Reader<'a> {
    blob: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u32_at(&self, off: usize) -> Result<u32, HarnessError> {
        let bytes = self
            .blob
            .get(off..off + 4)
            .ok_or_else(|| decode_err(format!("truncated blob at offset {}", off)))?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn u64_at(&self, off: usize) -> Result<u64, HarnessError> {
        let bytes = self
            .blob
            .get(off..off + 8)
            .ok_or_else(|| decode_err(format!("truncated blob at offset {}", off)))?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32, HarnessError> {
        let v = self.u32_at(self.pos)?;
        self.pos += 4;
        Ok(v)
    }

    /// NUL-terminated string at the cursor; advances past the 4-byte padding.
    fn read_name(&mut self) -> Result<String, HarnessError> {
        let start = self.pos;
        let end = self.blob[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| start + i)
            .ok_or_else(|| decode_err(format!("unterminated node name at offset {}", start)))?;
        let name = std::str::from_utf8(&self.blob[start..end])
            .map_err(|_| decode_err(format!("non-UTF-8 node name at offset {}", start)))?
            .to_string();
        self.pos = (end + 1 + 3) & !3;
        Ok(name)
    }

    fn string_at(&self, strings_off: usize, name_off: usize) -> Result<String, HarnessError> {
        let start = strings_off + name_off;
        let end = self
            .blob
            .get(start..)
            .and_then(|tail| tail.iter().position(|&b| b == 0))
            .map(|i| start + i)
            .ok_or_else(|| decode_err(format!("property name offset {} out of range", name_off)))?;
        std::str::from_utf8(&self.blob[start..end])
            .map(str::to_string)
            .map_err(|_| decode_err(format!("non-UTF-8 property name at offset {}", start)))
    }

    /// Parse a node body; the cursor sits just past its BEGIN_NODE tag.
    fn read_node(&mut self, strings_off: usize) -> Result<Node, HarnessError> {
        let name = self.read_name()?;
        let mut node = Node::new(name);
        loop {
            match self.read_u32()? {
                FDT_PROP => {
                    let len = self.read_u32()? as usize;
                    let name_off = self.read_u32()? as usize;
                    let prop_name = self.string_at(strings_off, name_off)?;
                    let value = self
                        .blob
                        .get(self.pos..self.pos + len)
                        .ok_or_else(|| {
                            decode_err(format!("truncated property value at offset {}", self.pos))
                        })?
                        .to_vec();
                    self.pos = (self.pos + len + 3) & !3;
                    if node.property(&prop_name).is_some() {
                        return Err(decode_err(format!(
                            "node '{}' defines property '{}' twice",
                            node.name, prop_name
                        )));
                    }
                    node.properties.push(Property {
                        name: prop_name,
                        value,
                    });
                }
                FDT_BEGIN_NODE => node.children.push(self.read_node(strings_off)?),
                FDT_END_NODE => return Ok(node),
                FDT_NOP => {}
                other => {
                    return Err(decode_err(format!(
                        "unexpected tag 0x{:08x} at offset {}",
                        other,
                        self.pos - 4
                    )))
                }
            }
        }
    }
}

struct Writer {
    structure: Vec<u8>,
    strings: Vec<u8>,
    interned: HashMap<String, u32>,
}

impl Writer {
    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn intern(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.interned.get(name) {
            return off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.interned.insert(name.to_string(), off);
        off
    }

    fn write_node(&mut self, node: &Node) -> Result<(), HarnessError> {
        if node.name.as_bytes().contains(&0) {
            return Err(HarnessError::EncodeError(format!(
                "node name {:?} contains a NUL byte",
                node.name
            )));
        }
        self.structure.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        self.structure.extend_from_slice(node.name.as_bytes());
        self.structure.push(0);
        self.pad();
        for prop in &node.properties {
            let len = u32::try_from(prop.value.len()).map_err(|_| {
                HarnessError::EncodeError(format!("property '{}' value too large", prop.name))
            })?;
            self.structure.extend_from_slice(&FDT_PROP.to_be_bytes());
            self.structure.extend_from_slice(&len.to_be_bytes());
            let name_off = self.intern(&prop.name);
            self.structure.extend_from_slice(&name_off.to_be_bytes());
            self.structure.extend_from_slice(&prop.value);
            self.pad();
        }
        for child in &node.children {
            self.write_node(child)?;
        }
        self.structure.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        Ok(())
    }
}
