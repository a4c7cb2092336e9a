// Executable header parsing: the split-ID primary header, its optional
// supplement, and the dispatch to the segmented-executable family.
//
// Header fields larger than the 16-bit segment space are rejected here;
// an oversized image is a hard load failure, never a truncation.

use crate::console_println;
use crate::error::{ExecError, ExecResult};
use crate::store::{read_exact, BackingStore};

/// Split-ID type values accepted in the primary header.
pub const SPLITID_AHISTORICAL: u32 = 0x0420_0301;
pub const SPLITID: u32 = 0x0430_0301;

/// Accepted primary header lengths.
pub const HDR_LEN_MINIMAL: u8 = 0x20;
pub const HDR_LEN_RELOC: u8 = 0x30;
pub const HDR_LEN_FARTEXT: u8 = 0x40;

pub const PRIMARY_HDR_SIZE: usize = 0x20;
pub const SUPL_HDR_SIZE: usize = 0x20;

/// Stub signature of the segmented-executable family.
pub const STUB_MAGIC: u16 = 0x5A4D;

pub(crate) fn rd16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub(crate) fn rd32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Supplement header carried by the relocatable variants. All-zero for the
/// minimal 0x20-byte header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuplHeader {
    /// Text relocation table size in bytes.
    pub trsize: u32,
    /// Data relocation table size in bytes.
    pub drsize: u32,
    /// Far-text size in bytes.
    pub ftseg: u16,
    /// Far-text relocation table size in bytes.
    pub ftrsize: u32,
    /// Data relocation base: nonzero places the stack below the data
    /// region, which starts at this paragraph-aligned offset.
    pub dbase: u16,
    /// On-disk (compressed) sizes; zero when stored uncompressed.
    pub compr_tseg: u16,
    pub compr_dseg: u16,
    pub compr_ftseg: u16,
}

impl SuplHeader {
    pub fn has_compressed(&self) -> bool {
        self.compr_tseg != 0 || self.compr_dseg != 0 || self.compr_ftseg != 0
    }
}

/// Parsed and validated split-ID header. Immutable once built; discarded
/// after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecHeader {
    /// Sizing-policy discriminant: 0 = legacy combined chmem, 1 = structured.
    pub version: u16,
    /// Text size in bytes (nonzero).
    pub tseg: u16,
    /// Initialized data size in bytes.
    pub dseg: u16,
    /// BSS size in bytes.
    pub bseg: u16,
    /// Entry offset within the code segment.
    pub entry: u16,
    /// Heap size (version 1) or combined memory size (version 0).
    pub chmem: u16,
    /// Declared minimum stack; 0 selects the default.
    pub minstack: u16,
    pub supl: SuplHeader,
}

/// Outcome of reading the primary header at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    SplitId(ExecHeader),
    /// Stub signature seen; the segmented-executable path owns the rest
    /// of the parse.
    Segmented,
}

fn field16(value: u32) -> ExecResult<u16> {
    u16::try_from(value).map_err(|_| ExecError::InvalidHeaderField)
}

/// Read and validate the header(s) at the store's current position
/// (the caller has positioned it at offset 0).
pub fn parse<S: BackingStore + ?Sized>(
    store: &mut S,
    allow_compressed: bool,
) -> ExecResult<ImageFormat> {
    let mut buf = [0u8; PRIMARY_HDR_SIZE];
    read_exact(store, &mut buf).map_err(|_| ExecError::BadHeader)?;

    if rd16(&buf, 0) == STUB_MAGIC {
        return Ok(ImageFormat::Segmented);
    }

    let typ = rd32(&buf, 0);
    if typ != SPLITID_AHISTORICAL && typ != SPLITID {
        console_println!("[x] EXEC: bad type {:#010x}", typ);
        return Err(ExecError::BadMagic);
    }

    let hlen = buf[4];
    let version = rd16(&buf, 6);
    let tseg = field16(rd32(&buf, 8))?;
    let dseg = field16(rd32(&buf, 12))?;
    let bseg = field16(rd32(&buf, 16))?;
    let entry = field16(rd32(&buf, 20))?;
    let chmem = rd16(&buf, 24);
    let minstack = rd16(&buf, 26);

    if tseg == 0 {
        console_println!("[x] EXEC: header declares no text");
        return Err(ExecError::BadHeader);
    }

    let supl = match hlen {
        HDR_LEN_MINIMAL => SuplHeader::default(),
        HDR_LEN_RELOC | HDR_LEN_FARTEXT => {
            parse_supplement(store, hlen as usize - PRIMARY_HDR_SIZE, allow_compressed)?
        }
        _ => return Err(ExecError::BadHeader),
    };

    console_println!(
        "[i] EXEC: split-ID v{} text {} data {} bss {} hlen {:#04x}",
        version,
        tseg,
        dseg,
        bseg,
        hlen
    );

    Ok(ImageFormat::SplitId(ExecHeader {
        version,
        tseg,
        dseg,
        bseg,
        entry,
        chmem,
        minstack,
        supl,
    }))
}

fn parse_supplement<S: BackingStore + ?Sized>(
    store: &mut S,
    on_disk: usize,
    allow_compressed: bool,
) -> ExecResult<SuplHeader> {
    // The short form carries only the relocation sizes and bases; the
    // missing tail parses as zero.
    let mut buf = [0u8; SUPL_HDR_SIZE];
    read_exact(store, &mut buf[..on_disk]).map_err(|_| ExecError::BadHeader)?;

    let trsize = rd32(&buf, 0);
    let drsize = rd32(&buf, 4);
    let tbase = rd32(&buf, 8);
    let dbase = field16(rd32(&buf, 12))?;
    let ftseg = field16(rd32(&buf, 16))?;
    let ftrsize = rd32(&buf, 20);
    let supl = SuplHeader {
        trsize,
        drsize,
        ftseg,
        ftrsize,
        dbase,
        compr_tseg: rd16(&buf, 24),
        compr_dseg: rd16(&buf, 26),
        compr_ftseg: rd16(&buf, 28),
    };

    if tbase != 0 {
        return Err(ExecError::InvalidHeaderField);
    }
    if supl.has_compressed() && !allow_compressed {
        return Err(ExecError::CompressionUnsupported);
    }
    if supl.dbase & 0xF != 0 {
        // The stack-below-data layout only works on a paragraph boundary.
        return Err(ExecError::InvalidHeaderField);
    }
    console_println!(
        "[i] EXEC: supplement trsize {} drsize {} ftseg {} ftrsize {} dbase {:#06x}",
        trsize,
        drsize,
        supl.ftseg,
        ftrsize,
        supl.dbase
    );
    Ok(supl)
}
