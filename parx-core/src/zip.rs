//! Minimal ZIP container primitives: Local File Header, Central Directory
//! File Header and End of Central Directory records.
//!
//! Field layouts follow the standard ZIP format bit-for-bit (30-byte LFH
//! prefix, 46-byte CDFH prefix, 22-byte EOCD prefix) so that the repair
//! tool's metadata validation (comparing a CDFH record against the raw
//! LFH bytes at its offset) is meaningful. ZIP64 overflow records are not
//! implemented: stripes are bounded by `chunksize` and never approach the
//! 4 GiB field limits, so the 32-bit fields are sufficient here.

use crate::error::EcError;
use std::collections::HashMap;

pub const LFH_SIGNATURE: u32 = 0x0403_4b50;
pub const CDFH_SIGNATURE: u32 = 0x0201_4b50;
pub const EOCD_SIGNATURE: u32 = 0x0605_4b50;

pub const LFH_BASE_SIZE: usize = 30;
pub const CDFH_BASE_SIZE: usize = 46;
pub const EOCD_BASE_SIZE: usize = 22;

fn dos_timestamp(unix_time: i64) -> (u16, u16) {
    // Coarse DOS time/date encoding; good enough for round-tripping our
    // own archives (seconds resolution of 2, years from 1980).
    let secs = unix_time.max(0) as u64;
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let hour = (rem / 3600) as u16;
    let min = ((rem % 3600) / 60) as u16;
    let sec = (rem % 60) as u16;
    let years_since_1980 = (days / 365).min(127) as u16;
    let time = (hour << 11) | (min << 5) | (sec / 2);
    let date = (years_since_1980 << 9) | (1 << 5) | 1;
    (time, date)
}

#[derive(Clone, Debug)]
pub struct Lfh {
    pub min_zip_version: u16,
    pub general_bit_flag: u16,
    pub compression_method: u16,
    pub time: u16,
    pub date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub filename: String,
    pub extra: Vec<u8>,
    pub lfh_size: usize,
}

impl Lfh {
    pub fn new(filename: impl Into<String>, crc32: u32, size: u32, unix_time: i64) -> Self {
        let filename = filename.into();
        let (time, date) = dos_timestamp(unix_time);
        let lfh_size = LFH_BASE_SIZE + filename.len();
        Lfh {
            min_zip_version: 10,
            general_bit_flag: 0,
            compression_method: 0,
            time,
            date,
            crc32,
            compressed_size: size,
            uncompressed_size: size,
            filename,
            extra: Vec::new(),
            lfh_size,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&LFH_SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&self.min_zip_version.to_le_bytes());
        buf.extend_from_slice(&self.general_bit_flag.to_le_bytes());
        buf.extend_from_slice(&self.compression_method.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.date.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        buf.extend_from_slice(&self.compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        buf.extend_from_slice(&(self.filename.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(self.extra.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.filename.as_bytes());
        buf.extend_from_slice(&self.extra);
    }

    /// Parses an LFH starting at `buf[0]`. Returns the record and its size.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), EcError> {
        if buf.len() < LFH_BASE_SIZE {
            return Err(EcError::CorruptedHeader("lfh truncated".into()));
        }
        let sig = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if sig != LFH_SIGNATURE {
            return Err(EcError::CorruptedHeader("bad lfh signature".into()));
        }
        let min_zip_version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let general_bit_flag = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let compression_method = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let time = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let date = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        let crc32 = u32::from_le_bytes(buf[14..18].try_into().unwrap());
        let compressed_size = u32::from_le_bytes(buf[18..22].try_into().unwrap());
        let uncompressed_size = u32::from_le_bytes(buf[22..26].try_into().unwrap());
        let filename_len = u16::from_le_bytes(buf[26..28].try_into().unwrap()) as usize;
        let extra_len = u16::from_le_bytes(buf[28..30].try_into().unwrap()) as usize;
        let lfh_size = LFH_BASE_SIZE + filename_len + extra_len;
        if buf.len() < lfh_size {
            return Err(EcError::CorruptedHeader("lfh truncated".into()));
        }
        let filename =
            String::from_utf8_lossy(&buf[LFH_BASE_SIZE..LFH_BASE_SIZE + filename_len]).into_owned();
        let extra = buf[LFH_BASE_SIZE + filename_len..lfh_size].to_vec();
        Ok((
            Lfh {
                min_zip_version,
                general_bit_flag,
                compression_method,
                time,
                date,
                crc32,
                compressed_size,
                uncompressed_size,
                filename,
                extra,
                lfh_size,
            },
            lfh_size,
        ))
    }
}

#[derive(Clone, Debug)]
pub struct Cdfh {
    pub zip_version: u16,
    pub min_zip_version: u16,
    pub general_bit_flag: u16,
    pub compression_method: u16,
    pub time: u16,
    pub date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub nb_disk: u16,
    pub intern_attr: u16,
    pub extern_attr: u32,
    /// Offset of the corresponding LFH record within the archive's data region.
    pub offset: u32,
    pub filename: String,
    pub cdfh_size: usize,
}

impl Cdfh {
    pub fn from_lfh(lfh: &Lfh, mode: u32, lfh_offset: u64) -> Self {
        let cdfh_size = CDFH_BASE_SIZE + lfh.filename.len();
        Cdfh {
            zip_version: (3 << 8) | 63,
            min_zip_version: lfh.min_zip_version,
            general_bit_flag: lfh.general_bit_flag,
            compression_method: lfh.compression_method,
            time: lfh.time,
            date: lfh.date,
            crc32: lfh.crc32,
            compressed_size: lfh.compressed_size,
            uncompressed_size: lfh.uncompressed_size,
            nb_disk: 0,
            intern_attr: 0,
            extern_attr: mode << 16,
            offset: lfh_offset as u32,
            filename: lfh.filename.clone(),
            cdfh_size,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&CDFH_SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&self.zip_version.to_le_bytes());
        buf.extend_from_slice(&self.min_zip_version.to_le_bytes());
        buf.extend_from_slice(&self.general_bit_flag.to_le_bytes());
        buf.extend_from_slice(&self.compression_method.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());
        buf.extend_from_slice(&self.date.to_le_bytes());
        buf.extend_from_slice(&self.crc32.to_le_bytes());
        buf.extend_from_slice(&self.compressed_size.to_le_bytes());
        buf.extend_from_slice(&self.uncompressed_size.to_le_bytes());
        buf.extend_from_slice(&(self.filename.len() as u16).to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // extra length
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment length
        buf.extend_from_slice(&self.nb_disk.to_le_bytes());
        buf.extend_from_slice(&self.intern_attr.to_le_bytes());
        buf.extend_from_slice(&self.extern_attr.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(self.filename.as_bytes());
    }

    pub fn parse(buf: &[u8]) -> Result<(Self, usize), EcError> {
        if buf.len() < CDFH_BASE_SIZE {
            return Err(EcError::CorruptedHeader("cdfh truncated".into()));
        }
        let sig = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if sig != CDFH_SIGNATURE {
            return Err(EcError::CorruptedHeader("bad cdfh signature".into()));
        }
        let zip_version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let min_zip_version = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let general_bit_flag = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let compression_method = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let time = u16::from_le_bytes(buf[12..14].try_into().unwrap());
        let date = u16::from_le_bytes(buf[14..16].try_into().unwrap());
        let crc32 = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let compressed_size = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let uncompressed_size = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        let filename_len = u16::from_le_bytes(buf[28..30].try_into().unwrap()) as usize;
        let extra_len = u16::from_le_bytes(buf[30..32].try_into().unwrap()) as usize;
        let comment_len = u16::from_le_bytes(buf[32..34].try_into().unwrap()) as usize;
        let nb_disk = u16::from_le_bytes(buf[34..36].try_into().unwrap());
        let intern_attr = u16::from_le_bytes(buf[36..38].try_into().unwrap());
        let extern_attr = u32::from_le_bytes(buf[38..42].try_into().unwrap());
        let offset = u32::from_le_bytes(buf[42..46].try_into().unwrap());
        let cdfh_size = CDFH_BASE_SIZE + filename_len + extra_len + comment_len;
        if buf.len() < cdfh_size {
            return Err(EcError::CorruptedHeader("cdfh truncated".into()));
        }
        let filename =
            String::from_utf8_lossy(&buf[CDFH_BASE_SIZE..CDFH_BASE_SIZE + filename_len]).into_owned();
        Ok((
            Cdfh {
                zip_version,
                min_zip_version,
                general_bit_flag,
                compression_method,
                time,
                date,
                crc32,
                compressed_size,
                uncompressed_size,
                nb_disk,
                intern_attr,
                extern_attr,
                offset,
                filename,
                cdfh_size,
            },
            cdfh_size,
        ))
    }
}

pub type CdVec = Vec<Cdfh>;
pub type CdMap = HashMap<String, usize>;

/// Parses consecutive CDFH records out of a buffer until the signature
/// stops matching (used both for a full archive's CD and for the
/// side-car metadata archive's per-archive CD blobs).
pub fn parse_central_directory(buf: &[u8]) -> Result<(CdVec, CdMap), EcError> {
    let mut cdvec = Vec::new();
    let mut cdmap = HashMap::new();
    let mut offset = 0usize;
    while offset + 4 <= buf.len() {
        let sig = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        if sig != CDFH_SIGNATURE {
            break;
        }
        let (cdfh, size) = Cdfh::parse(&buf[offset..])?;
        cdmap.insert(cdfh.filename.clone(), cdvec.len());
        cdvec.push(cdfh);
        offset += size;
    }
    Ok((cdvec, cdmap))
}

#[derive(Clone, Debug)]
pub struct Eocd {
    pub nb_disk: u16,
    pub nb_disk_cd: u16,
    pub nb_cd_rec_d: u16,
    pub nb_cd_rec: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
}

impl Eocd {
    pub fn new(cd_offset: u64, cd_count: u32, cd_size: u32) -> Self {
        let count = cd_count.min(u16::MAX as u32) as u16;
        Eocd {
            nb_disk: 0,
            nb_disk_cd: 0,
            nb_cd_rec_d: count,
            nb_cd_rec: count,
            cd_size,
            cd_offset: cd_offset.min(u32::MAX as u64) as u32,
        }
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&EOCD_SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&self.nb_disk.to_le_bytes());
        buf.extend_from_slice(&self.nb_disk_cd.to_le_bytes());
        buf.extend_from_slice(&self.nb_cd_rec_d.to_le_bytes());
        buf.extend_from_slice(&self.nb_cd_rec.to_le_bytes());
        buf.extend_from_slice(&self.cd_size.to_le_bytes());
        buf.extend_from_slice(&self.cd_offset.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // comment length
    }

    pub fn find_and_parse(buf: &[u8]) -> Result<Self, EcError> {
        if buf.len() < EOCD_BASE_SIZE {
            return Err(EcError::CorruptedHeader("eocd truncated".into()));
        }
        let mut offset = buf.len() as isize - EOCD_BASE_SIZE as isize;
        while offset >= 0 {
            let o = offset as usize;
            let sig = u32::from_le_bytes(buf[o..o + 4].try_into().unwrap());
            if sig == EOCD_SIGNATURE {
                let nb_disk = u16::from_le_bytes(buf[o + 4..o + 6].try_into().unwrap());
                let nb_disk_cd = u16::from_le_bytes(buf[o + 6..o + 8].try_into().unwrap());
                let nb_cd_rec_d = u16::from_le_bytes(buf[o + 8..o + 10].try_into().unwrap());
                let nb_cd_rec = u16::from_le_bytes(buf[o + 10..o + 12].try_into().unwrap());
                let cd_size = u32::from_le_bytes(buf[o + 12..o + 16].try_into().unwrap());
                let cd_offset = u32::from_le_bytes(buf[o + 16..o + 20].try_into().unwrap());
                return Ok(Eocd {
                    nb_disk,
                    nb_disk_cd,
                    nb_cd_rec_d,
                    nb_cd_rec,
                    cd_size,
                    cd_offset,
                });
            }
            offset -= 1;
        }
        Err(EcError::CorruptedHeader("eocd signature not found".into()))
    }
}
