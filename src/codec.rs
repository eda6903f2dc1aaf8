//! Serializes/deserializes a `Checkpoint` to the self-describing binary
//! artifact format of §6: fixed field widths, length-prefixed variable
//! segments, little-endian throughout, a single CRC32 digest at the tail.
//! Decoding is strict -- an unknown magic, an unsupported version major, or
//! a digest mismatch fails with `RdError::Corrupted`.

use crate::aslr::AslrPolicy;
use crate::checkpoint::Checkpoint;
use crate::error::{RdError, Result};
use crate::fd_entry::{FdType, FileDescriptorEntry};
use crate::memory_region::{MemoryDump, MemoryRegion, Perms};
use crate::registers::{RegisterFile, REGISTER_COUNT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

const MAGIC: &[u8; 8] = b"CHKPT\0\0\x01";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;

fn write_bytes_field<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)
}

fn read_bytes_field<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_string_field<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes_field(w, s.as_bytes())
}

fn read_string_field<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_bytes_field(r)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Serialize `checkpoint` to the wire format, appending the CRC32 digest
/// computed over every preceding byte.
pub fn encode(checkpoint: &Checkpoint) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(checkpoint, &mut buf).expect("encoding into an in-memory Vec cannot fail");

    let digest = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(digest).unwrap();
    buf
}

fn encode_into<W: Write>(c: &Checkpoint, w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_u16::<LittleEndian>(VERSION_MAJOR)?;
    w.write_u16::<LittleEndian>(VERSION_MINOR)?;
    w.write_i64::<LittleEndian>(c.created_at)?;
    w.write_i32::<LittleEndian>(c.pid)?;
    write_string_field(w, &c.name)?;
    w.write_u8(c.aslr_policy.to_u8())?;

    for field in c.registers.to_array().iter() {
        w.write_u64::<LittleEndian>(*field)?;
    }

    w.write_u32::<LittleEndian>(c.memory_map.len() as u32)?;
    for region in &c.memory_map {
        w.write_u64::<LittleEndian>(region.start)?;
        w.write_u64::<LittleEndian>(region.end)?;
        w.write_u8(region.perms.to_bits())?;
        w.write_u64::<LittleEndian>(region.offset)?;
        w.write_u64::<LittleEndian>(region.inode)?;
        write_string_field(w, &region.pathname)?;
    }

    w.write_u32::<LittleEndian>(c.memory_dumps.len() as u32)?;
    for dump in &c.memory_dumps {
        let region_index = c
            .memory_map
            .iter()
            .position(|r| r.start == dump.region.start && r.end == dump.region.end)
            .unwrap_or(0) as u32;
        w.write_u32::<LittleEndian>(region_index)?;
        w.write_u8(dump.valid() as u8)?;
        let bytes = dump.bytes().unwrap_or(&[]);
        write_bytes_field(w, bytes)?;
    }

    w.write_u32::<LittleEndian>(c.fds.len() as u32)?;
    for fd in &c.fds {
        w.write_i32::<LittleEndian>(fd.fd)?;
        w.write_u32::<LittleEndian>(fd.flags as u32)?;
        w.write_i64::<LittleEndian>(fd.offset)?;
        w.write_u8(fd.file_type.to_u8())?;
        write_string_field(w, &fd.path)?;
        w.write_u8(fd.restorable as u8)?;
    }

    Ok(())
}

/// Parse the wire format back into a `Checkpoint`. Strict: rejects an
/// unknown magic, an unsupported major version, or a digest mismatch.
/// `checkpoint_id` is not part of the wire format (it's an in-process
/// identity, not persisted state) and is reassigned by the caller.
pub fn decode(bytes: &[u8]) -> Result<Checkpoint> {
    if bytes.len() < 4 {
        return Err(RdError::Corrupted("artifact too short".into()));
    }
    let (body, digest_bytes) = bytes.split_at(bytes.len() - 4);
    let expected_digest = crc32fast::hash(body);
    let stored_digest = u32::from_le_bytes(digest_bytes.try_into().unwrap());
    if expected_digest != stored_digest {
        return Err(RdError::Corrupted("digest mismatch".into()));
    }

    let mut cursor = Cursor::new(body);

    let mut magic = [0u8; 8];
    cursor
        .read_exact(&mut magic)
        .map_err(|e| RdError::Corrupted(format!("short read of magic: {}", e)))?;
    if &magic != MAGIC {
        return Err(RdError::Corrupted("bad magic".into()));
    }

    let major = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| RdError::Corrupted(e.to_string()))?;
    let _minor = cursor
        .read_u16::<LittleEndian>()
        .map_err(|e| RdError::Corrupted(e.to_string()))?;
    if major != VERSION_MAJOR {
        return Err(RdError::Corrupted(format!("unsupported version major {}", major)));
    }

    let created_at = cursor.read_i64::<LittleEndian>().map_err(corrupt)?;
    let pid = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
    let name = read_string_field(&mut cursor).map_err(corrupt)?;
    let aslr_policy = AslrPolicy::from_u8(cursor.read_u8().map_err(corrupt)?);

    let mut reg_values = [0u64; REGISTER_COUNT];
    for slot in reg_values.iter_mut() {
        *slot = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
    }
    let registers = RegisterFile::from_array(&reg_values);

    let map_count = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
    let mut memory_map = Vec::with_capacity(map_count as usize);
    for _ in 0..map_count {
        let start = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
        let end = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
        let perms = Perms::from_bits(cursor.read_u8().map_err(corrupt)?);
        let offset = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
        let inode = cursor.read_u64::<LittleEndian>().map_err(corrupt)?;
        let pathname = read_string_field(&mut cursor).map_err(corrupt)?;
        memory_map.push(MemoryRegion {
            start,
            end,
            perms,
            pathname,
            inode,
            offset,
        });
    }

    let dump_count = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
    let mut memory_dumps = Vec::with_capacity(dump_count as usize);
    let mut seen_indices = std::collections::HashSet::new();
    for _ in 0..dump_count {
        let region_index = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
        let valid = cursor.read_u8().map_err(corrupt)? != 0;
        let data = read_bytes_field(&mut cursor).map_err(corrupt)?;

        if region_index as usize >= memory_map.len() {
            return Err(RdError::Corrupted(format!(
                "dump region index {} out of range (mapCount {})",
                region_index,
                memory_map.len()
            )));
        }
        if !seen_indices.insert(region_index) {
            return Err(RdError::Corrupted(format!("duplicate dump region index {}", region_index)));
        }

        let region = memory_map[region_index as usize].clone();
        let dump = if valid {
            if data.len() as u64 != region.len() {
                return Err(RdError::Corrupted("dump length does not match region length".into()));
            }
            MemoryDump::captured(region, data)
        } else {
            MemoryDump::invalid(region)
        };
        memory_dumps.push(dump);
    }

    let fd_count = cursor.read_u32::<LittleEndian>().map_err(corrupt)?;
    let mut fds = Vec::with_capacity(fd_count as usize);
    for _ in 0..fd_count {
        let fd = cursor.read_i32::<LittleEndian>().map_err(corrupt)?;
        let flags = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as i32;
        let offset = cursor.read_i64::<LittleEndian>().map_err(corrupt)?;
        let file_type = FdType::from_u8(cursor.read_u8().map_err(corrupt)?);
        let path = read_string_field(&mut cursor).map_err(corrupt)?;
        let restorable = cursor.read_u8().map_err(corrupt)? != 0;
        fds.push(FileDescriptorEntry {
            fd,
            path,
            flags,
            offset,
            file_type,
            restorable,
        });
    }

    Ok(Checkpoint {
        checkpoint_id: 0,
        name,
        created_at,
        pid,
        registers,
        memory_map,
        memory_dumps,
        fds,
        aslr_policy,
    })
}

fn corrupt(e: io::Error) -> RdError {
    RdError::Corrupted(format!("truncated artifact: {}", e))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registers::RegisterFile;

    fn sample_checkpoint() -> Checkpoint {
        let region = MemoryRegion {
            start: 0x1000,
            end: 0x2000,
            perms: Perms {
                readable: true,
                writable: true,
                executable: false,
                shared: false,
            },
            pathname: "[heap]".into(),
            inode: 0,
            offset: 0,
        };
        let dump = MemoryDump::captured(region.clone(), vec![0xABu8; 0x1000]);
        Checkpoint {
            checkpoint_id: 42,
            name: "test".into(),
            created_at: 1_700_000_000,
            pid: 1234,
            registers: RegisterFile::from_array(&[7u64; REGISTER_COUNT]),
            memory_map: vec![region],
            memory_dumps: vec![dump],
            fds: vec![FileDescriptorEntry {
                fd: 3,
                path: "/tmp/x".into(),
                flags: 0,
                offset: 10,
                file_type: FdType::Regular,
                restorable: true,
            }],
            aslr_policy: AslrPolicy::Full,
        }
    }

    #[test]
    fn round_trips_byte_for_byte() {
        let c = sample_checkpoint();
        let encoded = encode(&c);
        let decoded = decode(&encoded).unwrap();
        let reencoded = encode(&decoded);
        assert_eq!(encoded, reencoded);
    }

    #[test]
    fn decoded_fields_match() {
        let c = sample_checkpoint();
        let decoded = decode(&encode(&c)).unwrap();
        assert_eq!(decoded.name, c.name);
        assert_eq!(decoded.pid, c.pid);
        assert_eq!(decoded.registers, c.registers);
        assert_eq!(decoded.memory_map, c.memory_map);
        assert_eq!(decoded.aslr_policy, c.aslr_policy);
    }

    #[test]
    fn encoding_is_deterministic() {
        let c = sample_checkpoint();
        assert_eq!(encode(&c), encode(&c));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode(&sample_checkpoint());
        bytes[0] = b'X';
        let digest = crc32fast::hash(&bytes[..bytes.len() - 4]);
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(&digest.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(RdError::Corrupted(_))));
    }

    #[test]
    fn rejects_corrupted_digest() {
        let mut bytes = encode(&sample_checkpoint());
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert!(matches!(decode(&bytes), Err(RdError::Corrupted(_))));
    }

    #[test]
    fn rejects_out_of_range_region_index() {
        let c = sample_checkpoint();
        let mut bytes = encode(&c);

        // mapCount(4) + first region (start 8, end 8, perms 1, offset 8,
        // inode 8, pathLen 4, path "[heap]" 6) + dumpCount(4) precede the
        // first dump's regionIndex field.
        let region_index_offset =
            8 + 4 + 8 + 4 + 4 + 4 + 1 + REGISTER_COUNT * 8 + 4 + (8 + 8 + 1 + 8 + 8 + 4 + 6) + 4;
        bytes[region_index_offset..region_index_offset + 4].copy_from_slice(&99u32.to_le_bytes());

        let digest = crc32fast::hash(&bytes[..bytes.len() - 4]);
        let n = bytes.len();
        bytes[n - 4..].copy_from_slice(&digest.to_le_bytes());
        assert!(matches!(decode(&bytes), Err(RdError::Corrupted(_))));
    }
}
