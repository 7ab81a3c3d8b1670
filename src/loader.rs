//! Executable memory for generated code.
//!
//! Each program gets its own anonymous mapping: written while writable, then
//! flipped to read+execute. Mappings are never unmapped, so entry points stay
//! valid for the life of the process. Every loaded function is recorded in a
//! global table for program-counter lookup, announced to debuggers through
//! the GDB JIT interface and optionally to `perf` through its map file.

use std::io::Write;
use std::sync::LazyLock;

use memmap2::{Mmap, MmapMut};
use parking_lot::Mutex;

use crate::codegen::NativeCode;
use crate::config::Backend;
use crate::error::CompileError;
use crate::runtime::CallContext;

/// Signature of every generated entry point.
pub type EntryFn = unsafe extern "C" fn(*mut CallContext);

/// What the runtime knows about one loaded function.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub name: String,
    pub start: usize,
    pub len: usize,
    pub frame_size: u32,
    pub arg_pointer_map: u64,
    pub local_pointer_map: u64,
    /// `(code offset, line)` pairs; generated code has a single synthetic line.
    pub lines: Vec<(usize, u32)>,
}

impl FuncInfo {
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.start && pc < self.start + self.len
    }
}

/// A function in executable memory.
#[derive(Clone, Copy)]
pub struct LoadedFunction {
    entry: EntryFn,
    index: usize,
}

impl std::fmt::Debug for LoadedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedFunction")
            .field("name", &self.info().name)
            .field("start", &format_args!("{:#x}", self.info().start))
            .finish()
    }
}

impl LoadedFunction {
    pub fn info(&self) -> &'static FuncInfo {
        &FUNCTIONS[self.index]
    }

    /// # Safety
    /// `ctx` must be fully initialised over live buffers, as built by
    /// [`CallContext::new`].
    pub unsafe fn call(&self, ctx: &mut CallContext) {
        unsafe { (self.entry)(ctx) }
    }
}

/// Memory holding loaded code. Writable and executable are never both true.
pub trait ExecutableRegion: Send + Sync {
    fn as_ptr(&self) -> *const u8;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Anonymous page-aligned mapping, filled while writable and then flipped
/// to read+execute.
pub struct MmapRegion {
    map: Mmap,
    len: usize,
}

impl MmapRegion {
    pub fn new(code: &[u8]) -> std::io::Result<MmapRegion> {
        let mut map = MmapMut::map_anon(code.len().max(1))?;
        map[..code.len()].copy_from_slice(code);
        Ok(MmapRegion {
            map: map.make_exec()?,
            len: code.len(),
        })
    }
}

impl ExecutableRegion for MmapRegion {
    fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Regions and debugger records, kept alive forever.
struct Region {
    _code: Box<dyn ExecutableRegion>,
    _elf: Vec<u8>,
}

static FUNCTIONS: LazyLock<boxcar::Vec<FuncInfo>> = LazyLock::new(boxcar::Vec::new);
static REGIONS: Mutex<Vec<Region>> = Mutex::new(Vec::new());

/// Copies `native` into fresh executable memory.
pub fn load(native: &NativeCode, perf_map: bool) -> Result<LoadedFunction, CompileError> {
    if !Backend::native_available() {
        return Err(CompileError::Load("no native backend for this host".into()));
    }
    let region = MmapRegion::new(&native.code).map_err(|e| CompileError::Load(e.to_string()))?;
    load_region(Box::new(region), native, perf_map)
}

/// Registers code already placed in `region` as the function described by `native`.
pub fn load_region(
    region: Box<dyn ExecutableRegion>,
    native: &NativeCode,
    perf_map: bool,
) -> Result<LoadedFunction, CompileError> {
    if region.len() < native.code.len() || native.entry >= native.code.len().max(1) {
        return Err(CompileError::Load(format!(
            "{}: region of {} bytes cannot hold {} bytes of code",
            native.name,
            region.len(),
            native.code.len()
        )));
    }
    let start = region.as_ptr() as usize;
    let info = FuncInfo {
        name: native.name.clone(),
        start,
        len: native.code.len(),
        frame_size: native.frame_size,
        arg_pointer_map: native.arg_pointer_map,
        local_pointer_map: native.local_pointer_map,
        lines: vec![(native.entry, 1)],
    };

    let elf = build_elf(start as u64, info.len, &info.name);
    gdb::register(&elf);
    if perf_map {
        write_perf_map(&info);
    }

    // SAFETY: the region holds code generated for the `EntryFn` signature,
    // starting at `entry`, and is never released.
    let entry: EntryFn = unsafe { std::mem::transmute(start + native.entry) };

    tracing::debug!(name = %info.name, start = %format_args!("{start:#x}"), len = info.len, "loaded");
    let index = FUNCTIONS.push(info);
    REGIONS.lock().push(Region { _code: region, _elf: elf });
    Ok(LoadedFunction { entry, index })
}

/// The loaded function whose code contains `pc`.
pub fn lookup_pc(pc: usize) -> Option<&'static FuncInfo> {
    FUNCTIONS.iter().map(|(_, f)| f).find(|f| f.contains(pc))
}

fn write_perf_map(info: &FuncInfo) {
    let path = format!("/tmp/perf-{}.map", std::process::id());
    let file = std::fs::OpenOptions::new().create(true).append(true).open(&path);
    let result = file.and_then(|mut f| writeln!(f, "{:x} {:x} thriftjit::{}", info.start, info.len, info.name));
    if let Err(e) = result {
        tracing::warn!(%path, error = %e, "could not append to perf map");
    }
}

// ─── GDB JIT interface ──────────────────────────────────────────────────────
//
// https://sourceware.org/gdb/current/onlinedocs/gdb.html/JIT-Interface.html

mod gdb {
    use parking_lot::Mutex;

    const JIT_REGISTER_FN: u32 = 1;

    #[repr(C)]
    struct JitCodeEntry {
        next: *mut JitCodeEntry,
        prev: *mut JitCodeEntry,
        symfile_addr: *const u8,
        symfile_size: u64,
    }

    #[repr(C)]
    struct JitDescriptor {
        version: u32,
        action_flag: u32,
        relevant_entry: *mut JitCodeEntry,
        first_entry: *mut JitCodeEntry,
    }

    #[unsafe(no_mangle)]
    static mut __jit_debug_descriptor: JitDescriptor = JitDescriptor {
        version: 1,
        action_flag: 0,
        relevant_entry: std::ptr::null_mut(),
        first_entry: std::ptr::null_mut(),
    };

    #[unsafe(no_mangle)]
    #[inline(never)]
    extern "C" fn __jit_debug_register_code() {
        // Debuggers break here; keep the body.
        unsafe { std::ptr::read_volatile(&0u8) };
    }

    static LOCK: Mutex<()> = Mutex::new(());

    /// Announces an in-memory symbol file. `elf` must stay alive and unmoved
    /// for the rest of the process.
    pub(super) fn register(elf: &[u8]) {
        let entry = Box::into_raw(Box::new(JitCodeEntry {
            next: std::ptr::null_mut(),
            prev: std::ptr::null_mut(),
            symfile_addr: elf.as_ptr(),
            symfile_size: elf.len() as u64,
        }));
        let _guard = LOCK.lock();
        // SAFETY: the descriptor list is only touched under LOCK; entries are
        // leaked, so the list never dangles.
        unsafe {
            let desc = &raw mut __jit_debug_descriptor;
            let first = (*desc).first_entry;
            (*entry).next = first;
            if !first.is_null() {
                (*first).prev = entry;
            }
            (*desc).first_entry = entry;
            (*desc).action_flag = JIT_REGISTER_FN;
            (*desc).relevant_entry = entry;
            __jit_debug_register_code();
        }
    }
}

// ─── Symbol file ────────────────────────────────────────────────────────────

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

#[cfg(target_arch = "x86_64")]
const EM_MACHINE: u16 = 0x3e;
#[cfg(not(target_arch = "x86_64"))]
const EM_MACHINE: u16 = 0;

#[derive(Default)]
struct SectionHeader {
    name: u32,
    kind: u32,
    flags: u64,
    addr: u64,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    align: u64,
    entsize: u64,
}

impl SectionHeader {
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.link.to_le_bytes());
        out.extend_from_slice(&self.info.to_le_bytes());
        out.extend_from_slice(&self.align.to_le_bytes());
        out.extend_from_slice(&self.entsize.to_le_bytes());
    }
}

/// A minimal ELF64 object: one `.text` section pointing at the loaded code
/// (no file contents) and a symbol naming it.
fn build_elf(text_addr: u64, text_len: usize, name: &str) -> Vec<u8> {
    let shstrtab = b"\0.text\0.symtab\0.strtab\0.shstrtab\0";
    let (sh_text, sh_symtab, sh_strtab, sh_shstrtab) = (1, 7, 15, 23);

    let mut strtab = vec![0u8];
    strtab.extend_from_slice(b"thriftjit::");
    strtab.extend_from_slice(name.replace(' ', "::").as_bytes());
    strtab.push(0);

    let mut symtab = vec![0u8; SYM_SIZE];
    symtab.extend_from_slice(&1u32.to_le_bytes());
    symtab.push((1 << 4) | 2); // STB_GLOBAL, STT_FUNC
    symtab.push(0);
    symtab.extend_from_slice(&1u16.to_le_bytes());
    symtab.extend_from_slice(&text_addr.to_le_bytes());
    symtab.extend_from_slice(&(text_len as u64).to_le_bytes());

    let sections = 5;
    let symtab_off = EHDR_SIZE + sections * SHDR_SIZE;
    let strtab_off = symtab_off + symtab.len();
    let shstrtab_off = strtab_off + strtab.len();

    let mut elf = Vec::with_capacity(shstrtab_off + shstrtab.len());
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1]);
    elf.extend_from_slice(&[0; 9]);
    elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf.extend_from_slice(&EM_MACHINE.to_le_bytes());
    elf.extend_from_slice(&1u32.to_le_bytes());
    elf.extend_from_slice(&0u64.to_le_bytes());
    elf.extend_from_slice(&0u64.to_le_bytes());
    elf.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes());
    elf.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&(SHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(sections as u16).to_le_bytes());
    elf.extend_from_slice(&4u16.to_le_bytes());
    debug_assert_eq!(elf.len(), EHDR_SIZE);

    let headers = [
        SectionHeader::default(),
        SectionHeader {
            name: sh_text,
            kind: 1, // SHT_PROGBITS
            flags: 0x2 | 0x4,
            addr: text_addr,
            size: text_len as u64,
            align: 16,
            ..Default::default()
        },
        SectionHeader {
            name: sh_symtab,
            kind: 2,
            offset: symtab_off as u64,
            size: symtab.len() as u64,
            link: 3,
            info: 1,
            align: 8,
            entsize: SYM_SIZE as u64,
            ..Default::default()
        },
        SectionHeader {
            name: sh_strtab,
            kind: 3,
            offset: strtab_off as u64,
            size: strtab.len() as u64,
            align: 1,
            ..Default::default()
        },
        SectionHeader {
            name: sh_shstrtab,
            kind: 3,
            offset: shstrtab_off as u64,
            size: shstrtab.len() as u64,
            align: 1,
            ..Default::default()
        },
    ];
    for h in &headers {
        h.write(&mut elf);
    }
    elf.extend_from_slice(&symtab);
    elf.extend_from_slice(&strtab);
    elf.extend_from_slice(shstrtab);
    elf
}
