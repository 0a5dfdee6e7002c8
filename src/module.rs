//! ELF module resolution for the consumer side: map an ELF image to the
//! load bias and build-id the symbolizer needs to place captured addresses.
//!
//! The contract: among the image's `PT_LOAD` segments exactly one should be
//! executable; its `p_vaddr - p_offset` is the bias offset, and the runtime
//! bias of a mapping is `map_start - map_pgoff - bias_offset`. Images with
//! several executable LOADs break that assumption; we log it and keep the
//! first, which is right for every mainstream linker layout.

use std::fmt;
use std::io::Read;

use object::elf::{PF_R, PF_X};
use object::{Object, ObjectKind, ObjectSegment, SegmentFlags};
use smallvec::SmallVec;

use crate::error::TrackerError;

/// GNU build-id note contents. SHA-1 build ids are 20 bytes; other styles
/// (md5, uuid, explicit) fit inline too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildId {
    bytes: SmallVec<[u8; 20]>,
}

impl BuildId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<&[u8]> for BuildId {
    fn from(bytes: &[u8]) -> BuildId {
        BuildId {
            bytes: SmallVec::from_slice(bytes),
        }
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// `p_vaddr - p_offset` of the executable LOAD segment.
    pub bias_offset: u64,
    pub build_id: Option<BuildId>,
}

impl ModuleInfo {
    /// Runtime load bias of a mapping of this module placed at `map_start`
    /// with file page offset `map_pgoff`.
    pub fn load_bias(&self, map_start: u64, map_pgoff: u64) -> u64 {
        map_start
            .wrapping_sub(map_pgoff)
            .wrapping_sub(self.bias_offset)
    }
}

/// Resolve a module from its raw image bytes. `origin` is only used in
/// diagnostics.
pub fn module_info_from_bytes(data: &[u8], origin: &str) -> Result<ModuleInfo, TrackerError> {
    let file = object::File::parse(data)?;

    match file.kind() {
        ObjectKind::Executable | ObjectKind::Dynamic | ObjectKind::Core => {}
        kind => {
            return Err(TrackerError::InvalidElf(format!(
                "unsupported elf type {kind:?} in {origin}"
            )));
        }
    }

    let mut bias_offset = None;
    for segment in file.segments() {
        let SegmentFlags::Elf { p_flags } = segment.flags() else {
            continue;
        };
        const RX: u32 = PF_X | PF_R;
        if p_flags & RX != RX {
            continue;
        }
        let (file_offset, _) = segment.file_range();
        if bias_offset.is_none() {
            bias_offset = Some(segment.address().wrapping_sub(file_offset));
        } else {
            log::warn!("multiple executable LOAD segments in {origin}, using the first");
        }
    }

    let Some(bias_offset) = bias_offset else {
        return Err(TrackerError::InvalidElf(format!(
            "no executable LOAD segment in {origin}"
        )));
    };

    let build_id = file
        .build_id()
        .ok()
        .flatten()
        .map(BuildId::from);

    Ok(ModuleInfo {
        bias_offset,
        build_id,
    })
}

/// Resolve a module from an open file descriptor, e.g. one received over the
/// profiler's IPC channel.
pub fn module_info_from_file(
    file: &mut std::fs::File,
    origin: &str,
) -> Result<ModuleInfo, TrackerError> {
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    module_info_from_bytes(&data, origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ET_EXEC: u16 = 2;
    const ET_DYN: u16 = 3;
    const ET_REL: u16 = 1;
    const PT_LOAD: u32 = 1;

    struct Segment {
        flags: u32,
        offset: u64,
        vaddr: u64,
    }

    fn make_elf(e_type: u16, segments: &[Segment]) -> Vec<u8> {
        let mut elf = vec![
            0x7f, b'E', b'L', b'F', 2, 1, 1, 0, // ELFCLASS64, LSB
            0, 0, 0, 0, 0, 0, 0, 0,
        ];
        elf.extend_from_slice(&e_type.to_le_bytes());
        elf.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(elf.len(), 64);

        for segment in segments {
            elf.extend_from_slice(&PT_LOAD.to_le_bytes());
            elf.extend_from_slice(&segment.flags.to_le_bytes());
            elf.extend_from_slice(&segment.offset.to_le_bytes());
            elf.extend_from_slice(&segment.vaddr.to_le_bytes());
            elf.extend_from_slice(&segment.vaddr.to_le_bytes()); // p_paddr
            elf.extend_from_slice(&0x100u64.to_le_bytes()); // p_filesz
            elf.extend_from_slice(&0x100u64.to_le_bytes()); // p_memsz
            elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        }
        elf
    }

    #[test]
    fn bias_offset_comes_from_the_executable_load() {
        let elf = make_elf(
            ET_EXEC,
            &[
                Segment {
                    flags: PF_R,
                    offset: 0,
                    vaddr: 0x40_0000,
                },
                Segment {
                    flags: PF_R | PF_X,
                    offset: 0x1000,
                    vaddr: 0x40_1000,
                },
            ],
        );
        let info = module_info_from_bytes(&elf, "test.elf").unwrap();
        assert_eq!(info.bias_offset, 0x40_0000);
        assert_eq!(info.build_id, None);
    }

    #[test]
    fn multiple_executable_loads_use_the_first() {
        let elf = make_elf(
            ET_DYN,
            &[
                Segment {
                    flags: PF_R | PF_X,
                    offset: 0x1000,
                    vaddr: 0x1000,
                },
                Segment {
                    flags: PF_R | PF_X,
                    offset: 0x3000,
                    vaddr: 0x5000,
                },
            ],
        );
        let info = module_info_from_bytes(&elf, "test.elf").unwrap();
        assert_eq!(info.bias_offset, 0);
    }

    #[test]
    fn missing_executable_load_is_an_error() {
        let elf = make_elf(
            ET_DYN,
            &[Segment {
                flags: PF_R,
                offset: 0,
                vaddr: 0,
            }],
        );
        assert!(matches!(
            module_info_from_bytes(&elf, "test.elf"),
            Err(TrackerError::InvalidElf(_))
        ));
    }

    #[test]
    fn relocatable_objects_are_rejected() {
        let elf = make_elf(ET_REL, &[]);
        assert!(matches!(
            module_info_from_bytes(&elf, "test.o"),
            Err(TrackerError::InvalidElf(_))
        ));
    }

    #[test]
    fn garbage_is_an_object_error_not_a_panic() {
        assert!(module_info_from_bytes(&[0u8; 32], "garbage").is_err());
    }

    #[test]
    fn load_bias_subtracts_placement_and_offset() {
        let info = ModuleInfo {
            bias_offset: 0x1000,
            build_id: None,
        };
        assert_eq!(info.load_bias(0x7f00_0000_2000, 0x1000), 0x7f00_0000_0000);
    }

    #[test]
    fn resolves_from_an_open_file_descriptor() {
        use std::io::{Seek, Write};

        let elf = make_elf(
            ET_DYN,
            &[Segment {
                flags: PF_R | PF_X,
                offset: 0x1000,
                vaddr: 0x3000,
            }],
        );
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&elf).unwrap();
        file.rewind().unwrap();

        let info = module_info_from_file(&mut file, "tempfile.so").unwrap();
        assert_eq!(info.bias_offset, 0x2000);
    }

    #[test]
    fn resolves_the_running_executable() {
        let data = std::fs::read("/proc/self/exe").unwrap();
        let info = module_info_from_bytes(&data, "/proc/self/exe").unwrap();
        // Test binaries are PIE on every toolchain we run: executable LOAD
        // exists and the build id (if present) is hex-printable.
        if let Some(build_id) = &info.build_id {
            assert!(!build_id.as_bytes().is_empty());
            assert_eq!(build_id.to_string().len(), build_id.as_bytes().len() * 2);
        }
    }
}
