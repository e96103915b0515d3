//! Whole-system scenarios over a small hand-assembled ELF image.

use std::fs;

use rstest::rstest;

use crate::aux_data::schema::{FunctionEntries, LoaderStats};
use crate::config::DisasmConfig;
use crate::driver::{disassemble, disassemble_with, Registries};
use crate::ir::Module;
use crate::pass::loader_stats::LoaderStatsPass;
use crate::pass::pipeline::Pipeline;
use crate::pass::AnalysisPassExt;
use crate::target::builtin::EnabledTargets;
use crate::target::{detect_target, ByteOrder, FileFormat, Isa, TargetKey};
use crate::DisassemblyError;

const TEXT_ADDR: u64 = 0x401000;

/// 0x401000  push rbp
/// 0x401001  mov rbp, rsp
/// 0x401004  call 0x40100c
/// 0x401009  pop rbp
/// 0x40100a  ret
/// 0x40100b  nop
/// 0x40100c  xor eax, eax
/// 0x40100e  ret
/// 0x40100f  nop
const TEXT: [u8; 16] = [
    0x55, 0x48, 0x89, 0xe5, 0xe8, 0x03, 0x00, 0x00, 0x00, 0x5d, 0xc3, 0x90, 0x31, 0xc0, 0xc3, 0x90,
];

const SHSTRTAB: &[u8] = b"\0.text\0.shstrtab\0";

fn section_header(out: &mut Vec<u8>, name: u32, kind: u32, flags: u64, addr: u64, offset: u64, size: u64, align: u64) {
    out.extend_from_slice(&name.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&addr.to_le_bytes());
    out.extend_from_slice(&offset.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_link
    out.extend_from_slice(&0u32.to_le_bytes()); // sh_info
    out.extend_from_slice(&align.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes()); // sh_entsize
}

/// ELF64 x86-64 executable with `.text` and `.shstrtab` and no program
/// headers.
fn elf64_x64_image() -> Vec<u8> {
    elf64_x64_image_with(TextHeader::default())
}

/// Where `.text`'s section header says its contents live. The entry point
/// follows `addr`.
#[derive(Clone, Copy)]
struct TextHeader {
    addr: u64,
    offset: u64,
    size: u64,
}

const TEXT_OFFSET: u64 = 0x40;

impl Default for TextHeader {
    fn default() -> Self {
        Self {
            addr: TEXT_ADDR,
            offset: TEXT_OFFSET,
            size: TEXT.len() as u64,
        }
    }
}

fn elf64_x64_image_with(text: TextHeader) -> Vec<u8> {
    let text_offset = TEXT_OFFSET;
    let shstrtab_offset = text_offset + TEXT.len() as u64;
    let shoff = (shstrtab_offset + SHSTRTAB.len() as u64).next_multiple_of(8);

    let mut image = Vec::new();
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    image.extend_from_slice(&1u32.to_le_bytes());
    image.extend_from_slice(&text.addr.to_le_bytes()); // e_entry
    image.extend_from_slice(&0u64.to_le_bytes()); // e_phoff
    image.extend_from_slice(&shoff.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&3u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&2u16.to_le_bytes()); // e_shstrndx
    assert_eq!(image.len() as u64, text_offset);

    image.extend_from_slice(&TEXT);
    image.extend_from_slice(SHSTRTAB);
    image.resize(shoff as usize, 0);

    section_header(&mut image, 0, 0, 0, 0, 0, 0, 0);
    // SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR
    section_header(&mut image, 1, 1, 0x6, text.addr, text.offset, text.size, 16);
    // SHT_STRTAB
    section_header(&mut image, 7, 3, 0, 0, shstrtab_offset, SHSTRTAB.len() as u64, 1);
    image
}

const ELF_X64: TargetKey = TargetKey::new(FileFormat::Elf, Isa::X64, ByteOrder::Little);

#[test]
fn test_elf_loads_through_registry() {
    let image = elf64_x64_image();
    let registries = Registries::with_builtins(&EnabledTargets::default()).unwrap();
    let ctx = registries.context();

    let key = detect_target(&image, None);
    assert_eq!(key, ELF_X64);
    assert_eq!(key.to_string(), "ELF-X64-LE");

    let loader = ctx.targets.resolve(key).unwrap();
    assert_eq!(loader.name(), "elf");
    let mut module = loader.load(&image, key, "tiny", ctx.aux_types).unwrap();
    assert_eq!(module.entry_point, Some(TEXT_ADDR));
    assert_eq!(module.find_section(".text").unwrap().bytes, TEXT);

    let mut pipeline = Pipeline::new();
    pipeline.push(LoaderStatsPass::new());
    let report = pipeline.run(&ctx, &mut module).unwrap();

    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].slug, "Loader-Stats");
    assert_eq!(pipeline.pass(0).unwrap().name_slug(), "Loader-Stats");
    let stats = module.aux_data.get::<LoaderStats>(ctx.aux_types).unwrap().unwrap();
    assert_eq!(stats.executable_bytes, TEXT.len() as u64);
    assert_eq!(stats.symbols, 0);
}

#[test]
fn test_default_pipeline_end_to_end() {
    let image = elf64_x64_image();
    let config = DisasmConfig::default();
    let registries = Registries::with_builtins(&config.enabled_targets()).unwrap();
    let ctx = registries.context();

    let (module, report) = disassemble(&ctx, &image, "tiny", &config).unwrap();

    assert_eq!(
        report.passes.iter().map(|p| p.slug.as_str()).collect::<Vec<_>>(),
        vec!["Loader-Stats", "Disassembly", "Function-Inference"]
    );
    let disassembly = report.pass("Disassembly").unwrap();
    assert_eq!(disassembly.analyze.counter("instructions"), Some(9));
    assert_eq!(disassembly.analyze.counter("undecoded_bytes"), Some(0));

    let starts: Vec<_> = module.code_blocks.iter().map(|b| b.address).collect();
    assert_eq!(starts, vec![0x401000, 0x40100b, 0x40100c, 0x40100f]);
    assert_eq!(module.code_blocks[0].calls, vec![0x40100c]);
    assert_eq!(module.code_blocks[1].successors, vec![0x40100c]);

    let entries = module.aux_data.get::<FunctionEntries>(ctx.aux_types).unwrap().unwrap();
    assert_eq!(entries.len(), 2);

    let json = module.to_json(ctx.aux_types).unwrap();
    let restored = Module::from_json_checked(&json, ctx.aux_types).unwrap();
    assert_eq!(restored.code_blocks, module.code_blocks);
    assert_eq!(
        restored.aux_data.get::<FunctionEntries>(ctx.aux_types).unwrap(),
        Some(entries)
    );
}

#[test]
fn test_no_transform_still_chains_analysis() {
    let image = elf64_x64_image();
    let config = DisasmConfig {
        no_transform: true,
        ..Default::default()
    };
    let registries = Registries::with_builtins(&config.enabled_targets()).unwrap();

    let (module, report) = disassemble(&registries.context(), &image, "tiny", &config).unwrap();

    assert!(module.code_blocks.is_empty());
    assert!(!module.aux_data.contains("functionEntries"));
    let inference = report.pass("Function Inference").unwrap();
    assert_eq!(inference.load.counter("blocks"), Some(4));
    assert_eq!(inference.analyze.counter("functions"), Some(2));
    assert!(inference.transform.is_none());
}

#[test]
fn test_debug_dir_gets_facts_per_pass() {
    let dir = tempfile::tempdir().unwrap();
    let image = elf64_x64_image();
    let config = DisasmConfig {
        debug_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let registries = Registries::with_builtins(&config.enabled_targets()).unwrap();

    disassemble(&registries.context(), &image, "tiny", &config).unwrap();

    for slug in ["Loader-Stats", "Disassembly", "Function-Inference"] {
        assert!(dir.path().join(slug).is_dir(), "{} not dumped", slug);
    }
    let instructions = fs::read_to_string(dir.path().join("Disassembly/instruction.facts")).unwrap();
    assert_eq!(instructions.lines().count(), 9);
    assert!(instructions.starts_with("4198400\t1\tpush\trbp\n"));

    let entries: Vec<(u64,)> =
        crate::facts::read_facts(&dir.path().join("Function-Inference"), "function_entry").unwrap();
    assert_eq!(entries, vec![(0x401000,), (0x40100c,)]);
}

#[test]
fn test_unsupported_target_is_reported() {
    let image = elf64_x64_image();
    let registries = Registries::with_builtins(&EnabledTargets::only([Isa::Mips32])).unwrap();
    let mut pipeline = Pipeline::new();
    pipeline.push(LoaderStatsPass::new());

    let err = disassemble_with(
        &registries.context(),
        &image,
        "tiny",
        &DisasmConfig::default(),
        &mut pipeline,
    )
    .unwrap_err();

    assert!(matches!(err, DisassemblyError::UnsupportedTarget(key) if key == ELF_X64));
    assert_eq!(
        err.to_string(),
        "Cannot disassemble this input: unsupported target ELF-X64-LE"
    );
}

#[rstest]
#[case::wrapping_address(TextHeader { addr: 0xffff_ffff_ffff_fff8, ..Default::default() })]
#[case::size_past_end_of_file(TextHeader { size: 0x1000, ..Default::default() })]
#[case::offset_past_end_of_file(TextHeader { offset: 0x10_0000, ..Default::default() })]
#[case::offset_plus_size_wraps(TextHeader { offset: 0x40, size: u64::MAX, ..Default::default() })]
fn test_malformed_elf_is_reported(#[case] text: TextHeader) {
    let image = elf64_x64_image_with(text);
    assert_eq!(detect_target(&image, None), ELF_X64);
    let registries = Registries::with_builtins(&EnabledTargets::default()).unwrap();

    let err = disassemble(&registries.context(), &image, "bad", &DisasmConfig::default()).unwrap_err();

    assert!(
        matches!(err, DisassemblyError::ParsingError(_) | DisassemblyError::PassFailure(_)),
        "unexpected error: {}",
        err
    );
}

#[test]
fn test_section_at_top_of_address_space_is_rejected() {
    let image = elf64_x64_image_with(TextHeader {
        addr: 0xffff_ffff_ffff_fff8,
        ..Default::default()
    });
    let registries = Registries::with_builtins(&EnabledTargets::default()).unwrap();

    let err = disassemble(&registries.context(), &image, "high", &DisasmConfig::default()).unwrap_err();

    match err {
        DisassemblyError::ParsingError(message) => {
            assert!(message.contains("'.text'"), "{}", message);
            assert!(message.contains("overflows the address space"), "{}", message);
        }
        other => panic!("expected a parsing error, got {}", other),
    }
}
