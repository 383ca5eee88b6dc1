//! Binary emission: the code buffer, the label table, relocation records and
//! final image layout.
//!
//! Machine code is emitted front to back into a [`CodeBuffer`]. Any site
//! that refers to a not-yet-known address (a branch target, a RIP-relative
//! data reference, a pointer-sized initializer) is emitted as zero bytes and
//! recorded as a location against an interned [`Label`]. Once every function
//! and every data item has been staged, [`Module::finish`] lays out the
//! remaining segments in a fixed order — code, read-only data, initialized
//! data, then BSS (which occupies memory but no file bytes) — and patches
//! every recorded location. A label that is still unbound at that point is a
//! hard error.

use crate::result::{CodegenError, CodegenResult};
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use log::debug;
use std::collections::HashMap;

/// Offset in bytes from the beginning of the emitted code.
pub type CodeOffset = u32;

/// Sentinel address meaning "label not bound yet".
const UNBOUND: u64 = u64::max_value();

/// An opaque reference to an interned label name.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// The kind of patch a recorded location needs.
///
/// The relative kinds carry the absolute address the displacement is
/// measured from, i.e. the address of the byte following the encoded
/// displacement field.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reloc {
    /// 8-bit signed PC-relative displacement.
    Rel8 {
        /// Absolute address the displacement is relative to.
        base: u64,
    },
    /// 32-bit signed PC-relative displacement.
    Rel32 {
        /// Absolute address the displacement is relative to.
        base: u64,
    },
    /// 64-bit absolute address.
    Abs64,
}

/// One recorded patch site.
#[derive(Debug)]
struct LocationRecord {
    kind: Reloc,
    ip: CodeOffset,
    label: Label,
}

/// A growable little-endian byte buffer that machine code is emitted into.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length, which is also the offset of the next emitted byte.
    pub fn offset(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    /// Emit one byte.
    pub fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    /// Emit a 16-bit little-endian value.
    pub fn put2(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a 32-bit little-endian value.
    pub fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value.
    pub fn put8(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Pad with zero bytes until the length is a multiple of `align`.
    pub fn align_to(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        while self.bytes.len() % align as usize != 0 {
            self.bytes.push(0);
        }
    }

    /// The emitted bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Interned label names and their bound addresses.
///
/// Function names, global variables and generated local labels all share a
/// single namespace per translation unit, matching the flat-image linking
/// model: read-only string literals and compound-literal backing storage are
/// interned here under generated names.
pub struct LabelTable {
    names: PrimaryMap<Label, String>,
    by_name: HashMap<String, Label>,
    defs: SecondaryMap<Label, u64>,
    next_local: u32,
}

impl LabelTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            names: PrimaryMap::new(),
            by_name: HashMap::new(),
            defs: SecondaryMap::with_default(UNBOUND),
            next_local: 0,
        }
    }

    /// Intern `name`, returning the same `Label` for the same spelling.
    pub fn intern(&mut self, name: &str) -> Label {
        if let Some(&label) = self.by_name.get(name) {
            return label;
        }
        let label = self.names.push(name.to_string());
        self.by_name.insert(name.to_string(), label);
        label
    }

    /// Allocate a fresh local label (`.L0`, `.L1`, ...).
    pub fn alloc_local(&mut self) -> Label {
        loop {
            let name = format!(".L{}", self.next_local);
            self.next_local += 1;
            if !self.by_name.contains_key(&name) {
                return self.intern(&name);
            }
        }
    }

    /// The spelling of `label`.
    pub fn name(&self, label: Label) -> &str {
        &self.names[label]
    }

    /// Bind `label` to the absolute address `addr`.
    ///
    /// Rebinding a label is a compiler bug.
    pub fn bind(&mut self, label: Label, addr: u64) {
        debug_assert_eq!(self.defs[label], UNBOUND, "label {} bound twice", self.names[label]);
        self.defs[label] = addr;
    }

    /// The bound address of `label`, if it has one.
    pub fn resolve(&self, label: Label) -> Option<u64> {
        match self.defs[label] {
            UNBOUND => None,
            addr => Some(addr),
        }
    }
}

/// A staged initialized-data item.
struct DataItem {
    label: Label,
    bytes: Vec<u8>,
    align: u32,
    /// `(offset within bytes, target)` pairs patched as `Abs64`.
    relocs: Vec<(u32, Label)>,
}

/// A staged zero-initialized item.
struct BssItem {
    label: Label,
    size: u32,
    align: u32,
}

/// A named address in the finished image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,
    /// Absolute address.
    pub address: u64,
    /// Visible outside the unit (`false` for `static`).
    pub global: bool,
}

/// Sizes of the finished image, section by section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodeInfo {
    /// Machine code bytes.
    pub code_size: u32,
    /// Read-only data bytes (including alignment padding).
    pub rodata_size: u32,
    /// Initialized data bytes (including alignment padding).
    pub data_size: u32,
    /// Zero-initialized bytes, present in memory but not in the file.
    pub bss_size: u32,
}

impl CodeInfo {
    /// Number of bytes present in the file image.
    pub fn file_size(&self) -> u32 {
        self.code_size + self.rodata_size + self.data_size
    }

    /// Number of bytes occupied in memory once loaded.
    pub fn mem_size(&self) -> u32 {
        self.file_size() + self.bss_size
    }
}

/// The finished, fully patched output of a translation unit.
#[derive(Debug)]
pub struct Image {
    /// File bytes: code, then read-only data, then initialized data.
    pub bytes: Vec<u8>,
    /// Section sizes; `bytes.len() == info.file_size()`.
    pub info: CodeInfo,
    /// Base virtual address the image is linked at.
    pub start_address: u64,
    /// Named addresses, in definition order.
    pub symbols: Vec<Symbol>,
}

/// Per-translation-unit emission state: code buffer, label table, staged
/// data segments and the list of locations awaiting a patch.
pub struct Module {
    start_address: u64,
    /// The code buffer bytes are emitted into.
    pub code: CodeBuffer,
    /// Interned labels shared by code and data.
    pub labels: LabelTable,
    locations: Vec<LocationRecord>,
    rodata: Vec<DataItem>,
    data: Vec<DataItem>,
    bss: Vec<BssItem>,
    symbols: Vec<(Label, bool)>,
}

impl Module {
    /// Create an empty module linked at `start_address`.
    pub fn new(start_address: u64) -> Self {
        Self {
            start_address,
            code: CodeBuffer::new(),
            labels: LabelTable::new(),
            locations: Vec::new(),
            rodata: Vec::new(),
            data: Vec::new(),
            bss: Vec::new(),
            symbols: Vec::new(),
        }
    }

    /// The absolute address of the next emitted byte.
    pub fn cur_ip(&self) -> u64 {
        self.start_address + u64::from(self.code.offset())
    }

    /// Bind `label` to the current emission point.
    pub fn bind_here(&mut self, label: Label) {
        let ip = self.cur_ip();
        self.labels.bind(label, ip);
    }

    /// Record that the byte just emitted is an 8-bit displacement to
    /// `label`, relative to the current emission point.
    pub fn use_rel8(&mut self, label: Label) {
        debug_assert!(self.code.offset() >= 1);
        self.locations.push(LocationRecord {
            kind: Reloc::Rel8 { base: self.cur_ip() },
            ip: self.code.offset() - 1,
            label,
        });
    }

    /// Record that the last four bytes emitted are a 32-bit displacement to
    /// `label`, relative to the current emission point.
    pub fn use_rel32(&mut self, label: Label) {
        debug_assert!(self.code.offset() >= 4);
        self.locations.push(LocationRecord {
            kind: Reloc::Rel32 { base: self.cur_ip() },
            ip: self.code.offset() - 4,
            label,
        });
    }

    /// Record a 64-bit absolute reference to `label` at offset `ip`.
    pub fn use_abs64_at(&mut self, label: Label, ip: CodeOffset) {
        self.locations.push(LocationRecord {
            kind: Reloc::Abs64,
            ip,
            label,
        });
    }

    /// Add `label` to the symbol table of the finished image.
    pub fn declare_symbol(&mut self, label: Label, global: bool) {
        self.symbols.push((label, global));
    }

    /// Stage a read-only data item; emitted after all code.
    pub fn add_rodata(&mut self, label: Label, bytes: Vec<u8>, align: u32) {
        self.rodata.push(DataItem { label, bytes, align, relocs: Vec::new() });
    }

    /// Stage an initialized data item. `ptr_relocs` lists offsets within
    /// `bytes` holding a pointer to another label, patched as `Abs64`.
    pub fn add_data(&mut self, label: Label, bytes: Vec<u8>, align: u32, ptr_relocs: Vec<(u32, Label)>) {
        self.data.push(DataItem { label, bytes, align, relocs: ptr_relocs });
    }

    /// Stage a zero-initialized item, counted into the memory size only.
    pub fn add_bss(&mut self, label: Label, size: u32, align: u32) {
        self.bss.push(BssItem { label, size, align });
    }

    /// Lay out the remaining segments, patch every recorded location and
    /// return the finished image.
    pub fn finish(mut self) -> CodegenResult<Image> {
        let code_size = self.code.offset();

        for item in self.rodata.drain(..).collect::<Vec<_>>() {
            self.code.align_to(item.align);
            let ip = self.start_address + u64::from(self.code.offset());
            self.labels.bind(item.label, ip);
            for (ofs, target) in item.relocs {
                let site = self.code.offset() + ofs;
                self.locations.push(LocationRecord { kind: Reloc::Abs64, ip: site, label: target });
            }
            self.code.put_bytes(&item.bytes);
        }
        let rodata_size = self.code.offset() - code_size;

        for item in self.data.drain(..).collect::<Vec<_>>() {
            self.code.align_to(item.align);
            let ip = self.start_address + u64::from(self.code.offset());
            self.labels.bind(item.label, ip);
            for (ofs, target) in item.relocs {
                let site = self.code.offset() + ofs;
                self.locations.push(LocationRecord { kind: Reloc::Abs64, ip: site, label: target });
            }
            self.code.put_bytes(&item.bytes);
        }
        let data_size = self.code.offset() - code_size - rodata_size;

        let file_size = self.code.offset();
        let mut mem_end = u64::from(file_size);
        for item in &self.bss {
            let align = u64::from(item.align.max(1));
            mem_end = (mem_end + align - 1) & !(align - 1);
            self.labels.bind(item.label, self.start_address + mem_end);
            mem_end += u64::from(item.size);
        }
        let bss_size = (mem_end - u64::from(file_size)) as u32;

        let mut bytes = self.code.bytes.clone();
        for loc in &self.locations {
            let target = self
                .labels
                .resolve(loc.label)
                .ok_or_else(|| CodegenError::UnresolvedLabel(self.labels.name(loc.label).to_string()))?;
            let ip = loc.ip as usize;
            match loc.kind {
                Reloc::Rel8 { base } => {
                    let d = target.wrapping_sub(base) as i64;
                    if d < i64::from(i8::min_value()) || d > i64::from(i8::max_value()) {
                        return Err(CodegenError::OutOfRange(loc.ip));
                    }
                    bytes[ip] = d as u8;
                }
                Reloc::Rel32 { base } => {
                    let d = target.wrapping_sub(base) as i64;
                    if d < i64::from(i32::min_value()) || d > i64::from(i32::max_value()) {
                        return Err(CodegenError::OutOfRange(loc.ip));
                    }
                    bytes[ip..ip + 4].copy_from_slice(&(d as i32).to_le_bytes());
                }
                Reloc::Abs64 => {
                    bytes[ip..ip + 8].copy_from_slice(&target.to_le_bytes());
                }
            }
        }

        let mut symbols = Vec::with_capacity(self.symbols.len());
        for &(label, global) in &self.symbols {
            let address = self
                .labels
                .resolve(label)
                .ok_or_else(|| CodegenError::UnresolvedLabel(self.labels.name(label).to_string()))?;
            symbols.push(Symbol { name: self.labels.name(label).to_string(), address, global });
        }

        let info = CodeInfo { code_size, rodata_size, data_size, bss_size };
        debug!(
            "image: code {} rodata {} data {} bss {} (file {} mem {})",
            info.code_size,
            info.rodata_size,
            info.data_size,
            info.bss_size,
            info.file_size(),
            info.mem_size()
        );

        Ok(Image { bytes, info, start_address: self.start_address, symbols })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_interning() {
        let mut labels = LabelTable::new();
        let a = labels.intern("main");
        let b = labels.intern("main");
        assert_eq!(a, b);
        assert_eq!(labels.name(a), "main");
        let l0 = labels.alloc_local();
        let l1 = labels.alloc_local();
        assert_ne!(l0, l1);
        assert_eq!(labels.name(l0), ".L0");
    }

    #[test]
    fn rel32_patch() {
        let mut m = Module::new(0x1000);
        let target = m.labels.intern("f");
        // jmp f, then the target right behind it.
        m.code.put1(0xe9);
        m.code.put4(0);
        m.use_rel32(target);
        m.bind_here(target);
        m.code.put1(0xc3);
        let image = m.finish().unwrap();
        // Displacement from the end of the jmp to its own end is zero.
        assert_eq!(&image.bytes[..6], &[0xe9, 0, 0, 0, 0, 0xc3]);
    }

    #[test]
    fn rel8_backward() {
        let mut m = Module::new(0);
        let top = m.labels.intern("top");
        m.bind_here(top);
        m.code.put1(0x90);
        m.code.put1(0xeb);
        m.code.put1(0);
        m.use_rel8(top);
        let image = m.finish().unwrap();
        assert_eq!(image.bytes[2] as i8, -3);
    }

    #[test]
    fn abs64_in_data() {
        let mut m = Module::new(0x400000);
        let gv = m.labels.intern("g");
        let pv = m.labels.intern("p");
        m.code.put1(0xc3);
        m.declare_symbol(gv, true);
        m.declare_symbol(pv, true);
        m.add_data(gv, vec![42, 0, 0, 0], 4, vec![]);
        m.add_data(pv, vec![0; 8], 8, vec![(0, gv)]);
        let image = m.finish().unwrap();
        let g_addr = image.symbols_addr("g");
        let p_off = (image.symbols_addr("p") - image.start_address) as usize;
        assert_eq!(&image.bytes[p_off..p_off + 8], &g_addr.to_le_bytes());
    }

    #[test]
    fn bss_counts_into_memsize_only() {
        let mut m = Module::new(0);
        let b = m.labels.intern("buf");
        m.code.put1(0xc3);
        m.add_bss(b, 4096, 8);
        let image = m.finish().unwrap();
        assert_eq!(image.info.file_size(), 1);
        assert_eq!(image.info.mem_size(), 8 + 4096);
        assert_eq!(image.symbols_addr_opt("buf"), None); // not declared
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut m = Module::new(0);
        let missing = m.labels.intern("nowhere");
        m.code.put1(0xe8);
        m.code.put4(0);
        m.use_rel32(missing);
        match m.finish() {
            Err(CodegenError::UnresolvedLabel(name)) => assert_eq!(name, "nowhere"),
            other => panic!("expected unresolved label, got {:?}", other.map(|_| ())),
        }
    }

    impl Image {
        fn symbols_addr(&self, name: &str) -> u64 {
            self.symbols_addr_opt(name).unwrap()
        }

        fn symbols_addr_opt(&self, name: &str) -> Option<u64> {
            self.symbols.iter().find(|s| s.name == name).map(|s| s.address)
        }
    }
}
