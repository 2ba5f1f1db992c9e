//! journal 文件头操作
//!
//! 文件偏移 0 处是定长 152 字节的文件头，随后紧跟用户数据区域；
//! 整个 header 区域在磁盘上占 `align_up(152 + user_data_size,
//! alignment_size)` 字节，保证后续每一页的文件偏移都是对齐粒度。
//!
//! # 布局
//!
//! ```text
//! Offset  Size  Field
//! 0x00    4     magic ("PJRN")
//! 0x04    4     version
//! 0x08    4     block_size
//! 0x0C    4     blocks_per_page
//! 0x10    4     alignment_size
//! 0x14    4     user_data_size
//! 0x18    8     creation_micros
//! 0x20    4     geometry_crc (crc32 of bytes 0x00..0x20)
//! 0x24    4     reserved
//! 0x28    8     max_confirmed_records_kept (-1 = unlimited)
//! 0x30    8     max_confirmed_bytes_kept   (-1 = unlimited)
//! 0x38    8     max_file_size              (-1 = unlimited)
//! 0x40          StateHeader:
//! 0x40    4       confirmed_head
//! 0x44    4       confirmed_tail
//! 0x48    4       unconfirmed_head
//! 0x4C    4       unconfirmed_tail
//! 0x50    4       free_head
//! 0x54    4       num_pages
//! 0x58    4       highest_block_used (NIL_BLOCK = none)
//! 0x5C    4       reserved
//! 0x60    8       confirmed_records
//! 0x68    8       confirmed_blocks
//! 0x70    8       confirmed_bytes
//! 0x78    8       unconfirmed_records
//! 0x80    8       unconfirmed_blocks
//! 0x88    8       unconfirmed_bytes
//! 0x90    8       free_blocks
//! 0x98    END   (total 152 bytes, user data follows)
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{FORMAT_VERSION, JOURNAL_HEADER_SIZE, JOURNAL_MAGIC, NIL_BLOCK};
use crate::error::{Error, ErrorKind, Result};

/// 链表头尾与各链表计数（随每次事务提交写回映射）
///
/// 不变量：`confirmed_records/blocks/bytes` 恒等于沿已确认链表实际
/// 遍历得到的总和，未确认链表同理；任何块都不会同时出现在多个链表中。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHeader {
    /// 已确认链表头
    pub confirmed_head: u32,
    /// 已确认链表尾
    pub confirmed_tail: u32,
    /// 未确认链表头
    pub unconfirmed_head: u32,
    /// 未确认链表尾
    pub unconfirmed_tail: u32,
    /// 空闲链表头
    pub free_head: u32,
    /// 当前已映射页数
    pub num_pages: u32,
    /// 历史最高已用块索引（NIL_BLOCK 表示从未分配）
    pub highest_block_used: u32,
    /// 已确认记录数
    pub confirmed_records: u64,
    /// 已确认链表占用块数
    pub confirmed_blocks: u64,
    /// 已确认链表字节总数
    pub confirmed_bytes: u64,
    /// 未确认记录数
    pub unconfirmed_records: u64,
    /// 未确认链表占用块数
    pub unconfirmed_blocks: u64,
    /// 未确认链表字节总数
    pub unconfirmed_bytes: u64,
    /// 空闲块数
    pub free_blocks: u64,
}

impl StateHeader {
    /// 空 journal 的初始状态
    pub fn empty() -> Self {
        Self {
            confirmed_head: NIL_BLOCK,
            confirmed_tail: NIL_BLOCK,
            unconfirmed_head: NIL_BLOCK,
            unconfirmed_tail: NIL_BLOCK,
            free_head: NIL_BLOCK,
            num_pages: 0,
            highest_block_used: NIL_BLOCK,
            confirmed_records: 0,
            confirmed_blocks: 0,
            confirmed_bytes: 0,
            unconfirmed_records: 0,
            unconfirmed_blocks: 0,
            unconfirmed_bytes: 0,
            free_blocks: 0,
        }
    }
}

/// journal 文件头（内存中的权威副本）
///
/// 事务内的修改作用于此副本，`commit_transaction` 时整体编码写回
/// header 映射区域。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    /// 块大小（字节）
    pub block_size: u32,
    /// 每页块数
    pub blocks_per_page: u32,
    /// 对齐大小（字节，2 的幂）
    pub alignment_size: u32,
    /// 用户数据区域大小（字节）
    pub user_data_size: u32,
    /// journal 创建时间（Unix epoch 起微秒）
    pub creation_micros: u64,
    /// 确认后保留的最大记录数（-1 = 不限制）
    pub max_confirmed_records_kept: i64,
    /// 确认后保留的最大字节数（-1 = 不限制）
    pub max_confirmed_bytes_kept: i64,
    /// 文件大小上限（-1 = 不限制）
    pub max_file_size: i64,
    /// 链表状态
    pub state: StateHeader,
}

impl JournalHeader {
    /// 编码到 `buf`（长度必须恰为 [`JOURNAL_HEADER_SIZE`]）
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), JOURNAL_HEADER_SIZE);
        LittleEndian::write_u32(&mut buf[0x00..0x04], JOURNAL_MAGIC);
        LittleEndian::write_u32(&mut buf[0x04..0x08], FORMAT_VERSION);
        LittleEndian::write_u32(&mut buf[0x08..0x0C], self.block_size);
        LittleEndian::write_u32(&mut buf[0x0C..0x10], self.blocks_per_page);
        LittleEndian::write_u32(&mut buf[0x10..0x14], self.alignment_size);
        LittleEndian::write_u32(&mut buf[0x14..0x18], self.user_data_size);
        LittleEndian::write_u64(&mut buf[0x18..0x20], self.creation_micros);
        let crc = geometry_crc(&buf[0x00..0x20]);
        LittleEndian::write_u32(&mut buf[0x20..0x24], crc);
        LittleEndian::write_u32(&mut buf[0x24..0x28], 0);
        LittleEndian::write_i64(&mut buf[0x28..0x30], self.max_confirmed_records_kept);
        LittleEndian::write_i64(&mut buf[0x30..0x38], self.max_confirmed_bytes_kept);
        LittleEndian::write_i64(&mut buf[0x38..0x40], self.max_file_size);

        let s = &self.state;
        LittleEndian::write_u32(&mut buf[0x40..0x44], s.confirmed_head);
        LittleEndian::write_u32(&mut buf[0x44..0x48], s.confirmed_tail);
        LittleEndian::write_u32(&mut buf[0x48..0x4C], s.unconfirmed_head);
        LittleEndian::write_u32(&mut buf[0x4C..0x50], s.unconfirmed_tail);
        LittleEndian::write_u32(&mut buf[0x50..0x54], s.free_head);
        LittleEndian::write_u32(&mut buf[0x54..0x58], s.num_pages);
        LittleEndian::write_u32(&mut buf[0x58..0x5C], s.highest_block_used);
        LittleEndian::write_u32(&mut buf[0x5C..0x60], 0);
        LittleEndian::write_u64(&mut buf[0x60..0x68], s.confirmed_records);
        LittleEndian::write_u64(&mut buf[0x68..0x70], s.confirmed_blocks);
        LittleEndian::write_u64(&mut buf[0x70..0x78], s.confirmed_bytes);
        LittleEndian::write_u64(&mut buf[0x78..0x80], s.unconfirmed_records);
        LittleEndian::write_u64(&mut buf[0x80..0x88], s.unconfirmed_blocks);
        LittleEndian::write_u64(&mut buf[0x88..0x90], s.unconfirmed_bytes);
        LittleEndian::write_u64(&mut buf[0x90..0x98], s.free_blocks);
    }

    /// 从 `buf` 解码并校验 magic/版本/几何校验和
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < JOURNAL_HEADER_SIZE {
            return Err(Error::new(ErrorKind::InvalidFile, "file too short"));
        }
        if LittleEndian::read_u32(&buf[0x00..0x04]) != JOURNAL_MAGIC {
            return Err(Error::new(ErrorKind::InvalidFile, "bad magic"));
        }
        if LittleEndian::read_u32(&buf[0x04..0x08]) != FORMAT_VERSION {
            return Err(Error::new(
                ErrorKind::UnsupportedVersion,
                "unsupported format version",
            ));
        }
        let stored_crc = LittleEndian::read_u32(&buf[0x20..0x24]);
        if stored_crc != geometry_crc(&buf[0x00..0x20]) {
            return Err(Error::new(
                ErrorKind::InvalidFile,
                "geometry checksum mismatch",
            ));
        }

        Ok(Self {
            block_size: LittleEndian::read_u32(&buf[0x08..0x0C]),
            blocks_per_page: LittleEndian::read_u32(&buf[0x0C..0x10]),
            alignment_size: LittleEndian::read_u32(&buf[0x10..0x14]),
            user_data_size: LittleEndian::read_u32(&buf[0x14..0x18]),
            creation_micros: LittleEndian::read_u64(&buf[0x18..0x20]),
            max_confirmed_records_kept: LittleEndian::read_i64(&buf[0x28..0x30]),
            max_confirmed_bytes_kept: LittleEndian::read_i64(&buf[0x30..0x38]),
            max_file_size: LittleEndian::read_i64(&buf[0x38..0x40]),
            state: StateHeader {
                confirmed_head: LittleEndian::read_u32(&buf[0x40..0x44]),
                confirmed_tail: LittleEndian::read_u32(&buf[0x44..0x48]),
                unconfirmed_head: LittleEndian::read_u32(&buf[0x48..0x4C]),
                unconfirmed_tail: LittleEndian::read_u32(&buf[0x4C..0x50]),
                free_head: LittleEndian::read_u32(&buf[0x50..0x54]),
                num_pages: LittleEndian::read_u32(&buf[0x54..0x58]),
                highest_block_used: LittleEndian::read_u32(&buf[0x58..0x5C]),
                confirmed_records: LittleEndian::read_u64(&buf[0x60..0x68]),
                confirmed_blocks: LittleEndian::read_u64(&buf[0x68..0x70]),
                confirmed_bytes: LittleEndian::read_u64(&buf[0x70..0x78]),
                unconfirmed_records: LittleEndian::read_u64(&buf[0x78..0x80]),
                unconfirmed_blocks: LittleEndian::read_u64(&buf[0x80..0x88]),
                unconfirmed_bytes: LittleEndian::read_u64(&buf[0x88..0x90]),
                free_blocks: LittleEndian::read_u64(&buf[0x90..0x98]),
            },
        })
    }

    /// 确认保留记录数上限（None = 不限制）
    pub fn records_kept_limit(&self) -> Option<u64> {
        (self.max_confirmed_records_kept >= 0).then(|| self.max_confirmed_records_kept as u64)
    }

    /// 确认保留字节数上限（None = 不限制）
    pub fn bytes_kept_limit(&self) -> Option<u64> {
        (self.max_confirmed_bytes_kept >= 0).then(|| self.max_confirmed_bytes_kept as u64)
    }

    /// 文件大小上限（None = 不限制）
    pub fn file_size_limit(&self) -> Option<u64> {
        (self.max_file_size >= 0).then(|| self.max_file_size as u64)
    }
}

/// 几何区域校验和（0x00..0x20）
fn geometry_crc(prefix: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(prefix);
    hasher.finalize()
}
