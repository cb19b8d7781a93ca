// SPDX-License-Identifier: MPL-2.0

use kernel_quirks::{CpuInfo, Error, MappedImage, PAGE_SIZE, patch_kernel_cpuid};

const BASE: u64 = 0xFFFF_FF80_0020_0000;
const SET_INFO: usize = 0x100;
const SET_CPUFAMILY: usize = 0x800;
const IMAGE_SIZE: usize = 4 * PAGE_SIZE;

// Core i7-8700K with a microcode update applied.
const HOST: CpuInfo = CpuInfo {
    vendor: [0x756E_6547, 0x4965_6E69, 0x6C65_746E],
    leaf1: [0x0009_06EA, 0x0C10_0800, 0x7FFA_FBFF, 0xBFEB_FBFF],
    max_ext_leaf: 0x8000_0008,
    microcode_revision: 0xCA,
};

// Report an Ivy Bridge signature.
const DATA: [u32; 4] = [0x0003_06A9, 0, 0, 0];
const MASK: [u32; 4] = [0xFFFF_FFFF, 0, 0, 0];

fn symbols() -> [(&'static str, u64); 2] {
    [
        ("_cpuid_set_cpufamily", BASE + SET_CPUFAMILY as u64),
        ("_cpuid_set_info", BASE + SET_INFO as u64),
    ]
}

fn put(bytes: &mut [u8], at: usize, code: &[u8]) {
    bytes[at..at + code.len()].copy_from_slice(code);
}

fn mov_imm32(opcode: u8, imm: u32) -> Vec<u8> {
    let mut code = vec![opcode];
    code.extend_from_slice(&imm.to_le_bytes());
    code
}

#[test]
fn release_kernel() {
    let mut bytes = vec![0xCC; IMAGE_SIZE];
    // mov ecx, 8Bh; xor eax, eax; xor edx, edx; wrmsr; mov eax, 1;
    // xor ebx, ebx; xor ecx, ecx; xor edx, edx; cpuid
    let site = SET_INFO + 0x20;
    put(
        &mut bytes,
        site,
        &[
            0xB9, 0x8B, 0x00, 0x00, 0x00, 0x31, 0xC0, 0x31, 0xD2, 0x0F, 0x30, 0xB8, 0x01, 0x00,
            0x00, 0x00, 0x31, 0xDB, 0x31, 0xC9, 0x31, 0xD2, 0x0F, 0xA2,
        ],
    );
    // mov ecx, 8Bh; rdmsr
    let microcode = SET_INFO + 0x80;
    put(&mut bytes, microcode, &[0xB9, 0x8B, 0x00, 0x00, 0x00, 0x0F, 0x32]);

    let symbols = symbols();
    let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
    assert_eq!(patch_kernel_cpuid(&mut image, &HOST, DATA, MASK), Ok(2));

    let mut expected = Vec::new();
    expected.extend(mov_imm32(0xB8, 0x0003_06A9));
    expected.extend(mov_imm32(0xBB, HOST.leaf1[1]));
    // The host already reports OSXSAVE.
    expected.extend(mov_imm32(0xB9, HOST.leaf1[2]));
    expected.extend(mov_imm32(0xBA, HOST.leaf1[3]));
    expected.extend([0x90; 4]);
    assert_eq!(&bytes[site..site + 24], expected.as_slice());

    let mut expected = mov_imm32(0xBA, 0xCA);
    expected.extend([0x90; 2]);
    assert_eq!(&bytes[microcode..microcode + 7], expected.as_slice());
}

#[test]
fn release_kernel_without_microcode_read() {
    let mut bytes = vec![0xCC; IMAGE_SIZE];
    // mov ecx, 8Bh; xor edx, edx; wrmsr; mov eax, 1;
    // xor ebx, ebx; xor ecx, ecx; xor edx, edx; cpuid
    put(
        &mut bytes,
        SET_INFO + 0x20,
        &[
            0xB9, 0x8B, 0x00, 0x00, 0x00, 0x31, 0xD2, 0x0F, 0x30, 0xB8, 0x01, 0x00, 0x00, 0x00,
            0x31, 0xDB, 0x31, 0xC9, 0x31, 0xD2, 0x0F, 0xA2,
        ],
    );
    let before = bytes.clone();

    let symbols = symbols();
    let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
    assert_eq!(
        patch_kernel_cpuid(&mut image, &HOST, DATA, MASK),
        Err(Error::Unsupported)
    );
    assert_eq!(bytes, before);
}

// Lays out the landmarks of the legacy `cpuid_set_info`, with the `cpuid` of
// leaf 0x80000000 at `end_at`.
fn legacy_image(end_at: usize) -> Vec<u8> {
    let mut bytes = vec![0xCC; IMAGE_SIZE];
    // mov edx, 4; lea rsi, [rip+44332211h]
    put(
        &mut bytes,
        SET_INFO + 0x10,
        &[0xBA, 0x04, 0x00, 0x00, 0x00, 0x48, 0x8D, 0x35, 0x11, 0x22, 0x33, 0x44],
    );
    // mov byte ptr [...], 0; mov eax, 80000000h
    put(&mut bytes, end_at - 0x10, &[0x00, 0xB8, 0x00, 0x00, 0x00, 0x80]);
    // cpuid; mov ...
    put(&mut bytes, end_at, &[0x0F, 0xA2, 0x89]);
    // mov eax, 1; cpuid; mov ...
    put(
        &mut bytes,
        SET_INFO + 0x90,
        &[0xB8, 0x01, 0x00, 0x00, 0x00, 0x0F, 0xA2, 0x89],
    );
    bytes
}

#[test]
fn legacy_kernel() {
    let mut bytes = legacy_image(SET_INFO + 0x70);
    let symbols = symbols();
    let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
    assert_eq!(patch_kernel_cpuid(&mut image, &HOST, DATA, MASK), Ok(3));

    let start = SET_INFO + 0x1C;
    let end = SET_INFO + 0x6D;
    let location = SET_INFO + 0x90;

    // The vendor string is stored directly.
    assert_eq!(&bytes[start..start + 5], mov_imm32(0xB8, HOST.vendor[0]).as_slice());
    assert_eq!(&bytes[start + 5..start + 7], &[0x89, 0x06]);
    assert_eq!(&bytes[start + 7..start + 11], &[0x48, 0x83, 0xC6, 0x04]);

    // The highest extended leaf is loaded instead of queried.
    assert_eq!(&bytes[end..end + 5], mov_imm32(0xB8, HOST.max_ext_leaf).as_slice());

    // jmp short end
    let jump = start + 29;
    assert_eq!(bytes[jump], 0xEB);
    assert_eq!(usize::from(bytes[jump + 1]), end - (jump + 2));

    // The override loads, then a jump back behind the original cpuid.
    let override_at = jump + 2;
    assert_eq!(
        &bytes[override_at..override_at + 5],
        mov_imm32(0xB8, 0x0003_06A9).as_slice()
    );
    assert_eq!(bytes[override_at + 20], 0xE9);
    let back = i32::from_le_bytes(bytes[override_at + 21..override_at + 25].try_into().unwrap());
    assert_eq!(override_at as i64 + 25 + i64::from(back), (location + 7) as i64);
    assert!(bytes[override_at + 25..end].iter().all(|byte| *byte == 0x90));

    // The original leaf-1 query detours into the override.
    assert_eq!(bytes[location], 0xE9);
    let detour = i32::from_le_bytes(bytes[location + 1..location + 5].try_into().unwrap());
    assert_eq!(location as i64 + 5 + i64::from(detour), override_at as i64);
    assert_eq!(&bytes[location + 5..location + 7], &[0x90, 0x90]);
}

#[test]
fn legacy_kernel_without_room() {
    let mut bytes = legacy_image(SET_INFO + 0x50);
    let before = bytes.clone();

    // Without the debug symbol the capacity failure is reported as is.
    let symbols = [("_cpuid_set_info", BASE + SET_INFO as u64)];
    let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
    assert_eq!(
        patch_kernel_cpuid(&mut image, &HOST, DATA, MASK),
        Err(Error::OutOfResources)
    );
    assert_eq!(bytes, before);
}

#[test]
fn debug_kernel() {
    let mut bytes = vec![0xCC; IMAGE_SIZE];
    let symbols = symbols();
    let mut image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
    assert_eq!(patch_kernel_cpuid(&mut image, &HOST, DATA, MASK), Ok(1));

    let stub = &bytes[SET_CPUFAMILY..SET_CPUFAMILY + 65];
    // mov dword ptr [rdi+68h], signature
    assert_eq!(&stub[..3], &[0xC7, 0x47, 0x68]);
    assert_eq!(&stub[3..7], &0x0003_06A9u32.to_le_bytes());
    // mov byte ptr [rdi+50h], stepping
    assert_eq!(&stub[7..11], &[0xC6, 0x47, 0x50, 0x09]);
    // family 6, model 0x3A
    assert_eq!(&stub[17..19], &[0x06, 0x3A]);
    // mov eax, CPUFAMILY_INTEL_IVYBRIDGE; ret
    assert_eq!(&stub[59..64], mov_imm32(0xB8, 0x1F65_E835).as_slice());
    assert_eq!(stub[64], 0xC3);
    assert_eq!(bytes[SET_CPUFAMILY + 65], 0xCC);
}

#[test]
fn missing_set_info() {
    let mut bytes = vec![0xCC; IMAGE_SIZE];
    let mut image = MappedImage::without_symbols(BASE, &mut bytes);
    assert_eq!(
        patch_kernel_cpuid(&mut image, &HOST, DATA, MASK),
        Err(Error::NotFound)
    );
}
