//! USTAR archive extraction, used to unpack the initrd into the VFS at
//! boot. Grounded in the original kernel's `fs/ustar.c`.

use crate::prelude::*;
use crate::vfs::{self, VType};

const BLOCK_SIZE: usize = 512;
const NAME_LEN: usize = 100;
const SIZE_OFF: usize = 124;
const SIZE_LEN: usize = 12;
const CHECKSUM_OFF: usize = 148;
const CHECKSUM_LEN: usize = 8;
const TYPEFLAG_OFF: usize = 156;
const MAGIC_OFF: usize = 257;
const MAGIC_LEN: usize = 5;
const PREFIX_OFF: usize = 345;
const PREFIX_LEN: usize = 155;

const TYPE_REGULAR: u8 = b'0';
const TYPE_DIRECTORY: u8 = b'5';

fn parse_octal(bytes: &[u8]) -> u64 {
    let mut result = 0u64;
    for &b in bytes {
        if !(b'0'..=b'7').contains(&b) {
            break;
        }
        result = (result << 3) + (b - b'0') as u64;
    }
    result
}

fn cstr_field(block: &[u8], off: usize, len: usize) -> &str {
    let field = &block[off..off + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

fn validate_checksum(block: &[u8]) -> bool {
    let stored = parse_octal(&block[CHECKSUM_OFF..CHECKSUM_OFF + CHECKSUM_LEN]);
    let mut sum: u32 = 0;
    for (i, &b) in block.iter().enumerate() {
        if i >= CHECKSUM_OFF && i < CHECKSUM_OFF + CHECKSUM_LEN {
            sum += b' ' as u32;
        } else {
            sum += b as u32;
        }
    }
    sum as u64 == stored
}

/// Extracts a USTAR archive into the already-mounted filesystem tree
/// rooted at `dest_path`, creating directories and regular files as it
/// walks header-by-header.
pub fn extract(archive: &[u8], dest_path: &str) -> KResult<()> {
    vfs::lookup(dest_path)?;

    let mut offset = 0usize;
    while offset + BLOCK_SIZE <= archive.len() {
        let header = &archive[offset..offset + BLOCK_SIZE];

        if header[0] == 0 {
            break;
        }
        if &header[MAGIC_OFF..MAGIC_OFF + MAGIC_LEN] != b"ustar" {
            offset += BLOCK_SIZE;
            continue;
        }
        if !validate_checksum(header) {
            offset += BLOCK_SIZE;
            continue;
        }

        let file_size = parse_octal(&header[SIZE_OFF..SIZE_OFF + SIZE_LEN]) as usize;
        let name = cstr_field(header, 0, NAME_LEN);
        let prefix = cstr_field(header, PREFIX_OFF, PREFIX_LEN);
        let typeflag = header[TYPEFLAG_OFF];
        offset += BLOCK_SIZE;

        let entry_path = if prefix.is_empty() {
            alloc::format!("{}", name)
        } else {
            alloc::format!("{}{}", prefix, name)
        };
        let full_path = crate::path::canonicalize(&crate::path::join(dest_path, &entry_path));

        match typeflag {
            TYPE_DIRECTORY => match vfs::create(&full_path, VType::Directory) {
                Ok(_) | Err(Errno::EEXIST) => {}
                Err(_) => println_warn!("ustar: failed to create directory {}", full_path),
            },
            TYPE_REGULAR => {
                let vn = match vfs::create(&full_path, VType::Regular) {
                    Ok(vn) => Some(vn),
                    Err(Errno::EEXIST) => vfs::lookup(&full_path).ok(),
                    Err(_) => None,
                };
                match vn {
                    Some(vn) if file_size > 0 => {
                        let data = &archive[offset..offset + file_size];
                        if vfs::write(&vn, 0, data).map(|n| n != file_size).unwrap_or(true) {
                            println_warn!("ustar: failed to write to created file {}", full_path);
                        }
                    }
                    Some(_) => {}
                    None => println_warn!("ustar: failed to create file {}", full_path),
                }
            }
            _ => {}
        }

        let blocks = (file_size + BLOCK_SIZE - 1) / BLOCK_SIZE;
        offset += blocks * BLOCK_SIZE;
    }

    println_info!("Loaded archive into filesystem.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksum(block: &mut [u8; BLOCK_SIZE]) {
        let mut sum: u32 = 0;
        for (i, &b) in block.iter().enumerate() {
            if i >= CHECKSUM_OFF && i < CHECKSUM_OFF + CHECKSUM_LEN {
                sum += b' ' as u32;
            } else {
                sum += b as u32;
            }
        }
        let field = alloc::format!("{:06o}\0 ", sum);
        block[CHECKSUM_OFF..CHECKSUM_OFF + field.len().min(CHECKSUM_LEN)]
            .copy_from_slice(&field.as_bytes()[..field.len().min(CHECKSUM_LEN)]);
    }

    fn make_header(name: &str, typeflag: u8, size: usize) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..name.len()].copy_from_slice(name.as_bytes());
        let size_field = alloc::format!("{:011o}\0", size);
        block[SIZE_OFF..SIZE_OFF + size_field.len()].copy_from_slice(size_field.as_bytes());
        block[TYPEFLAG_OFF] = typeflag;
        block[MAGIC_OFF..MAGIC_OFF + 5].copy_from_slice(b"ustar");
        checksum(&mut block);
        block
    }

    #[test]
    fn parse_octal_reads_up_to_first_non_octal_byte() {
        assert_eq!(parse_octal(b"0000644\0"), 0o644);
        assert_eq!(parse_octal(b"000\0\0\0\0\0"), 0);
    }

    #[test]
    fn checksum_roundtrips() {
        let header = make_header("hello.txt", TYPE_REGULAR, 5);
        assert!(validate_checksum(&header));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut header = make_header("hello.txt", TYPE_REGULAR, 5);
        header[0] = b'x';
        assert!(!validate_checksum(&header));
    }
}
