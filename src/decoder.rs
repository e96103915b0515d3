//! Capstone-based instruction decoders for the supported ISAs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use capstone::{Arch, Capstone, Endian, Mode, NO_EXTRA_MODE};

use crate::target::{ByteOrder, Isa};
use crate::{Address, Decoder, DisassemblyError, FlowKind, Insn, MAX_INSTRUCTION_SIZE};

thread_local! {
    // Capstone handles are not Sync, so each thread keeps its own, keyed by
    // (arch, mode, endian).
    static CS_POOL: RefCell<HashMap<(Arch, Mode, Endian), Rc<Capstone>>> =
        RefCell::new(HashMap::new());
}

/// Capstone decoder for one (ISA, byte order) pair.
#[derive(Debug, Clone, Copy)]
pub struct CapstoneDecoder {
    isa: Isa,
    arch: Arch,
    mode: Mode,
    endian: Endian,
}

impl CapstoneDecoder {
    /// Create a decoder for `isa` in `byte_order`.
    pub fn for_target(isa: Isa, byte_order: ByteOrder) -> Result<Self, DisassemblyError> {
        let endian = match byte_order {
            ByteOrder::Little => Endian::Little,
            ByteOrder::Big => Endian::Big,
            ByteOrder::Undefined => {
                return Err(DisassemblyError::DecoderError(format!(
                    "No byte order given for {}",
                    isa
                )))
            }
        };
        let (arch, mode) = match isa {
            Isa::Ia32 => (Arch::X86, Mode::Mode32),
            Isa::X64 => (Arch::X86, Mode::Mode64),
            Isa::Arm => (Arch::ARM, Mode::Arm),
            Isa::Arm64 => (Arch::ARM64, Mode::Arm),
            Isa::Mips32 => (Arch::MIPS, Mode::Mips32),
            Isa::Undefined => {
                return Err(DisassemblyError::DecoderError(
                    "No instruction decoder for an undefined ISA".into(),
                ))
            }
        };

        // Build once up front so an unusable combination fails here rather
        // than silently decoding nothing.
        Capstone::new_raw(arch, mode, NO_EXTRA_MODE, Some(endian))
            .map_err(|e| DisassemblyError::DecoderError(format!("Capstone error for {}: {}", isa, e)))?;

        Ok(Self {
            isa,
            arch,
            mode,
            endian,
        })
    }

    /// Get the ISA of this decoder
    pub fn isa(&self) -> Isa {
        self.isa
    }

    fn handle(&self) -> Option<Rc<Capstone>> {
        let key = (self.arch, self.mode, self.endian);
        CS_POOL.with(|cell| {
            let mut pool = cell.borrow_mut();
            if let Some(cs) = pool.get(&key) {
                return Some(Rc::clone(cs));
            }
            let cs = Rc::new(Capstone::new_raw(self.arch, self.mode, NO_EXTRA_MODE, Some(self.endian)).ok()?);
            pool.insert(key, Rc::clone(&cs));
            Some(cs)
        })
    }
}

impl fmt::Display for CapstoneDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapstoneDecoder::{}", self.isa)
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, image: &[u8], offset: usize, address: Address) -> Option<Insn> {
        if offset >= image.len() {
            return None;
        }

        // Only look at a small slice (16 bytes max)
        let end = std::cmp::min(offset + MAX_INSTRUCTION_SIZE, image.len());
        let cs = self.handle()?;

        let disasm_result = cs.disasm_count(&image[offset..end], address, 1).ok()?;
        let i = disasm_result.iter().next()?;
        if i.address() != address {
            return None;
        }

        let mut bytes = [0u8; MAX_INSTRUCTION_SIZE];
        for (j, b) in i.bytes().iter().enumerate().take(MAX_INSTRUCTION_SIZE) {
            bytes[j] = *b;
        }
        let mnemonic = i.mnemonic().unwrap_or("").to_string();
        let operands = i.op_str().unwrap_or("").to_string();
        let flow = classify(self.isa, &mnemonic, &operands);

        Some(Insn {
            addr: i.address(),
            size: i.bytes().len() as u8,
            mnemonic,
            operands,
            bytes,
            flow,
        })
    }
}

const ARM_CONDITIONS: &[&str] = &[
    "eq", "ne", "cs", "hs", "cc", "lo", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

/// Control-flow class of an instruction from its mnemonic.
pub fn classify(isa: Isa, mnemonic: &str, operands: &str) -> FlowKind {
    let m = mnemonic.to_ascii_lowercase();
    let m = m.as_str();
    match isa {
        Isa::Ia32 | Isa::X64 => match m {
            "jmp" | "ljmp" => FlowKind::Jump,
            "call" | "lcall" => FlowKind::Call,
            "ret" | "retf" | "retn" | "iret" | "iretd" | "iretq" | "hlt" | "ud2" => FlowKind::Return,
            _ if m.starts_with('j') || m.starts_with("loop") => FlowKind::ConditionalJump,
            _ => FlowKind::Sequential,
        },
        Isa::Arm | Isa::Arm64 => {
            let ops = operands.to_ascii_lowercase();
            match m {
                "b" | "br" => FlowKind::Jump,
                "bl" | "blx" | "blr" => FlowKind::Call,
                "ret" => FlowKind::Return,
                "bx" if ops.trim() == "lr" => FlowKind::Return,
                "bx" => FlowKind::Jump,
                "cbz" | "cbnz" | "tbz" | "tbnz" => FlowKind::ConditionalJump,
                "pop" | "ldm" | "ldmia" if ops.contains("pc") => FlowKind::Return,
                _ => {
                    let Some(rest) = m.strip_prefix('b') else {
                        return FlowKind::Sequential;
                    };
                    let rest = rest.trim_start_matches('.');
                    if ARM_CONDITIONS.contains(&rest) {
                        FlowKind::ConditionalJump
                    } else if rest
                        .strip_prefix('l')
                        .is_some_and(|cond| ARM_CONDITIONS.contains(&cond))
                    {
                        FlowKind::Call
                    } else {
                        FlowKind::Sequential
                    }
                }
            }
        }
        Isa::Mips32 => match m {
            "j" | "b" => FlowKind::Jump,
            "jal" | "jalr" | "bal" => FlowKind::Call,
            "jr" if operands.trim() == "$ra" => FlowKind::Return,
            "jr" => FlowKind::Jump,
            _ if m.starts_with('b') && m.len() > 1 && !m.starts_with("break") => {
                FlowKind::ConditionalJump
            }
            _ => FlowKind::Sequential,
        },
        Isa::Undefined => FlowKind::Sequential,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_isa_mapping() {
        let decoder = CapstoneDecoder::for_target(Isa::X64, ByteOrder::Little).unwrap();
        assert_eq!(decoder.isa(), Isa::X64);
        assert!(CapstoneDecoder::for_target(Isa::Undefined, ByteOrder::Little).is_err());
        assert!(CapstoneDecoder::for_target(Isa::X64, ByteOrder::Undefined).is_err());
    }

    #[test]
    fn test_x86_decode() {
        // mov eax, 1
        let bytes = [0xb8, 0x01, 0x00, 0x00, 0x00];
        let decoder = CapstoneDecoder::for_target(Isa::Ia32, ByteOrder::Little).unwrap();

        let insn = decoder.decode(&bytes, 0, 0x400000).unwrap();
        assert_eq!(insn.mnemonic, "mov");
        assert_eq!(insn.size, 5);
        assert_eq!(insn.addr, 0x400000);
        assert_eq!(insn.flow, FlowKind::Sequential);
        assert_eq!(insn.bytes(), &bytes);
    }

    #[test]
    fn test_decode_past_end() {
        let decoder = CapstoneDecoder::for_target(Isa::X64, ByteOrder::Little).unwrap();
        assert!(decoder.decode(&[0x90], 1, 0).is_none());
    }

    #[test]
    fn test_x64_call_target() {
        // call 0x1010 from 0x1000 (e8 rel32 = 0x0b)
        let bytes = [0xe8, 0x0b, 0x00, 0x00, 0x00];
        let decoder = CapstoneDecoder::for_target(Isa::X64, ByteOrder::Little).unwrap();
        let insn = decoder.decode(&bytes, 0, 0x1000).unwrap();
        assert_eq!(insn.flow, FlowKind::Call);
        assert_eq!(insn.branch_target(), Some(0x1010));
    }

    #[rstest]
    #[case(Isa::X64, "jmp", "0x10", FlowKind::Jump)]
    #[case(Isa::X64, "jne", "0x10", FlowKind::ConditionalJump)]
    #[case(Isa::X64, "ret", "", FlowKind::Return)]
    #[case(Isa::X64, "push", "rbp", FlowKind::Sequential)]
    #[case(Isa::Arm64, "b.eq", "#0x10", FlowKind::ConditionalJump)]
    #[case(Isa::Arm64, "bl", "#0x10", FlowKind::Call)]
    #[case(Isa::Arm64, "bic", "x0, x1, x2", FlowKind::Sequential)]
    #[case(Isa::Arm, "bls", "#0x10", FlowKind::ConditionalJump)]
    #[case(Isa::Arm, "blne", "#0x10", FlowKind::Call)]
    #[case(Isa::Arm, "bx", "lr", FlowKind::Return)]
    #[case(Isa::Arm, "pop", "{r4, pc}", FlowKind::Return)]
    #[case(Isa::Mips32, "jr", "$ra", FlowKind::Return)]
    #[case(Isa::Mips32, "beqz", "$a0, 0x40", FlowKind::ConditionalJump)]
    #[case(Isa::Mips32, "jal", "0x400", FlowKind::Call)]
    #[case(Isa::Mips32, "break", "", FlowKind::Sequential)]
    fn test_classify(#[case] isa: Isa, #[case] mnemonic: &str, #[case] operands: &str, #[case] expected: FlowKind) {
        assert_eq!(classify(isa, mnemonic, operands), expected);
    }
}
