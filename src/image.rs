//! Views over the protected module's executable image and the VM context the
//! loader hands to the tracer.

use iced_x86::Register;
use pelite::image::IMAGE_SCN_MEM_EXECUTE;
use pelite::pe64::{Pe, PeFile, PeObject, PeView};

/// Abstraction over an immutable, virtually-mapped view of the protected
/// module's image.
///
/// The tracer copies [`VmImage::mapped`] into emulator memory at the module
/// base and uses [`VmImage::executable`] to vet candidate branch targets.
pub trait VmImage {
    /// The preferred image base from the executable header.
    fn image_base(&self) -> u64;

    /// The size of the mapped image in bytes.
    fn image_size(&self) -> u64;

    /// The mapped image contents, laid out by virtual address from offset 0.
    fn mapped(&self) -> &[u8];

    /// Whether `rva` lies inside a section mapped with execute permission.
    fn executable(&self, rva: u64) -> bool;
}

impl<I: VmImage> VmImage for &I {
    fn image_base(&self) -> u64 {
        (*self).image_base()
    }

    fn image_size(&self) -> u64 {
        (*self).image_size()
    }

    fn mapped(&self) -> &[u8] {
        (*self).mapped()
    }

    fn executable(&self, rva: u64) -> bool {
        (*self).executable(rva)
    }
}

impl VmImage for PeView<'_> {
    fn image_base(&self) -> u64 {
        self.optional_header().ImageBase
    }

    fn image_size(&self) -> u64 {
        self.optional_header().SizeOfImage as u64
    }

    fn mapped(&self) -> &[u8] {
        self.image()
    }

    fn executable(&self, rva: u64) -> bool {
        self.section_headers().iter().any(|s| {
            let start = s.VirtualAddress as u64;
            let size = s.VirtualSize.max(s.SizeOfRawData) as u64;
            (start..start + size).contains(&rva) && s.Characteristics & IMAGE_SCN_MEM_EXECUTE != 0
        })
    }
}

/// An owned, virtually-mapped image with an explicit executable-range table.
///
/// Produced by [`map_pe_file`] when working from an on-disk PE, or built by
/// hand for synthetic images in tests.
#[derive(Debug, Clone)]
pub struct MappedImage {
    /// Preferred image base.
    pub base: u64,
    /// Image contents in virtual layout.
    pub bytes: Vec<u8>,
    /// RVA ranges mapped with execute permission.
    pub exec: Vec<std::ops::Range<u64>>,
}

impl VmImage for MappedImage {
    fn image_base(&self) -> u64 {
        self.base
    }

    fn image_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn mapped(&self) -> &[u8] {
        &self.bytes
    }

    fn executable(&self, rva: u64) -> bool {
        self.exec.iter().any(|r| r.contains(&rva))
    }
}

/// Lay an on-disk PE out in virtual layout at its preferred base.
///
/// Headers and each section's raw data are copied to their virtual addresses;
/// the gap bytes stay zero. Sections with `IMAGE_SCN_MEM_EXECUTE` populate the
/// executable-range table.
pub fn map_pe_file(file: &[u8]) -> Result<MappedImage, pelite::Error> {
    let pe = PeFile::from_bytes(file)?;
    let opt = pe.optional_header();

    let mut bytes = vec![0u8; opt.SizeOfImage as usize];
    let headers = (opt.SizeOfHeaders as usize).min(file.len()).min(bytes.len());
    bytes[..headers].copy_from_slice(&file[..headers]);

    let mut exec = Vec::new();
    for s in pe.section_headers().iter() {
        let va = s.VirtualAddress as usize;
        let raw = s.PointerToRawData as usize;
        let raw_size = s.SizeOfRawData as usize;
        if let (Some(src), Some(dst)) = (
            file.get(raw..(raw + raw_size).min(file.len())),
            bytes.get_mut(va..),
        ) {
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        if s.Characteristics & IMAGE_SCN_MEM_EXECUTE != 0 {
            let size = s.VirtualSize.max(s.SizeOfRawData) as u64;
            exec.push(va as u64..va as u64 + size);
        }
    }

    Ok(MappedImage {
        base: opt.ImageBase,
        bytes,
        exec,
    })
}

/// The VM context for one protected routine, as produced by the loader and the
/// VM-context discovery pass.
#[derive(Debug, Clone, Copy)]
pub struct VmCtx {
    /// Runtime load address of the module inside the emulator.
    pub module_base: u64,
    /// Preferred base from the PE header. Virtual bytecode addresses embedded
    /// in the program are relative to this.
    pub image_base: u64,
    /// Size of the mapped image.
    pub image_size: u64,
    /// RVA of the VMENTER stub.
    pub vm_entry_rva: u32,
    /// Native register the obfuscator assigned to the virtual instruction
    /// pointer.
    pub vip: Register,
    /// Native register the obfuscator assigned to the virtual stack pointer.
    pub vsp: Register,
}

impl VmCtx {
    /// Build a context for `image`, loaded at `module_base`.
    pub fn new<I: VmImage>(
        image: &I,
        module_base: u64,
        vm_entry_rva: u32,
        vip: Register,
        vsp: Register,
    ) -> Self {
        Self {
            module_base,
            image_base: image.image_base(),
            image_size: image.image_size(),
            vm_entry_rva,
            vip,
            vsp,
        }
    }
}
