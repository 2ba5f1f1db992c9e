//! 磁盘数据结构定义
//!
//! 每个映射页的开头是一张块头表：每个数据块对应一个定长
//! [`BlockHeader`] 表项。记录的首块表项承载完整的记录头；
//! 续块表项只使用 `next_block`（块链）；空闲块表项只使用
//! `next_block`（空闲链表）。
//!
//! # 字节序
//!
//! 所有多字节字段统一小端序编码（`byteorder::LittleEndian`），
//! 格式跨平台可移植。
//!
//! # 布局
//!
//! ```text
//! Offset  Size  Field
//! 0x00    4     next_block
//! 0x04    4     prev_record
//! 0x08    4     next_record
//! 0x0C    4     tail_block
//! 0x10    4     length
//! 0x14    4     num_blocks
//! 0x18    8     creation_micros
//! 0x20    8     confirmation_micros
//! 0x28    1     owner
//! 0x29    7     reserved
//! 0x30    END   (total 48 bytes)
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{BLOCK_HEADER_SIZE, NIL_BLOCK};
use crate::error::{Error, ErrorKind, Result};

/// 记录句柄：记录首块的块索引
///
/// 句柄在记录存活期间稳定；记录被 `remove_record` 释放后，同一索引
/// 会被后续分配复用。在 remove 之后继续持有旧句柄是未定义行为契约
/// （`owner` 标签能拦截指向空闲块或续块的陈旧句柄，但无法拦截已被
/// 新记录复用的索引）。
pub type RecordHandle = u32;

/// 块的归属标签
///
/// 每个块在任意时刻恰好属于 {空闲链表, 未确认链表, 已确认链表} 之一；
/// 多块记录的续块单独打标，使句柄校验为 O(1)。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockOwner {
    /// 空闲链表成员
    Free = 0,
    /// 未确认记录的首块
    Unconfirmed = 1,
    /// 已确认记录的首块
    Confirmed = 2,
    /// 多块记录的续块
    Continuation = 3,
}

impl BlockOwner {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BlockOwner::Free),
            1 => Ok(BlockOwner::Unconfirmed),
            2 => Ok(BlockOwner::Confirmed),
            3 => Ok(BlockOwner::Continuation),
            _ => Err(Error::new(
                ErrorKind::Internal,
                "corrupted block owner tag",
            )),
        }
    }
}

/// 块头表项
///
/// 首块表项即记录头；`next_block` 在三种归属下分别充当块链/空闲链。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// 块链下一块（记录内），或空闲链表下一块
    pub next_block: u32,
    /// 记录链表前驱（仅首块有效）
    pub prev_record: u32,
    /// 记录链表后继（仅首块有效）
    pub next_record: u32,
    /// 块链末块缓存，支持 O(1) 整链释放（仅首块有效）
    pub tail_block: u32,
    /// 记录字节长度（仅首块有效）
    pub length: u32,
    /// 记录占用块数，恒等于 ceil(length / block_size)（仅首块有效）
    pub num_blocks: u32,
    /// 创建时间（Unix epoch 起微秒，UTC）
    pub creation_micros: u64,
    /// 确认时间；仅记录进入已确认链表后有意义
    pub confirmation_micros: u64,
    /// 归属标签
    pub owner: BlockOwner,
}

impl BlockHeader {
    /// 空闲块表项
    pub fn free(next_block: u32) -> Self {
        Self {
            next_block,
            prev_record: NIL_BLOCK,
            next_record: NIL_BLOCK,
            tail_block: NIL_BLOCK,
            length: 0,
            num_blocks: 0,
            creation_micros: 0,
            confirmation_micros: 0,
            owner: BlockOwner::Free,
        }
    }

    /// 续块表项
    pub fn continuation(next_block: u32) -> Self {
        Self {
            owner: BlockOwner::Continuation,
            ..Self::free(next_block)
        }
    }

    /// 编码到 `buf`（长度必须恰为 [`BLOCK_HEADER_SIZE`]）
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), BLOCK_HEADER_SIZE);
        LittleEndian::write_u32(&mut buf[0x00..0x04], self.next_block);
        LittleEndian::write_u32(&mut buf[0x04..0x08], self.prev_record);
        LittleEndian::write_u32(&mut buf[0x08..0x0C], self.next_record);
        LittleEndian::write_u32(&mut buf[0x0C..0x10], self.tail_block);
        LittleEndian::write_u32(&mut buf[0x10..0x14], self.length);
        LittleEndian::write_u32(&mut buf[0x14..0x18], self.num_blocks);
        LittleEndian::write_u64(&mut buf[0x18..0x20], self.creation_micros);
        LittleEndian::write_u64(&mut buf[0x20..0x28], self.confirmation_micros);
        buf[0x28] = self.owner as u8;
        buf[0x29..0x30].fill(0);
    }

    /// 从 `buf` 解码
    pub fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert_eq!(buf.len(), BLOCK_HEADER_SIZE);
        Ok(Self {
            next_block: LittleEndian::read_u32(&buf[0x00..0x04]),
            prev_record: LittleEndian::read_u32(&buf[0x04..0x08]),
            next_record: LittleEndian::read_u32(&buf[0x08..0x0C]),
            tail_block: LittleEndian::read_u32(&buf[0x0C..0x10]),
            length: LittleEndian::read_u32(&buf[0x10..0x14]),
            num_blocks: LittleEndian::read_u32(&buf[0x14..0x18]),
            creation_micros: LittleEndian::read_u64(&buf[0x18..0x20]),
            confirmation_micros: LittleEndian::read_u64(&buf[0x20..0x28]),
            owner: BlockOwner::from_u8(buf[0x28])?,
        })
    }

    /// 是否为活动记录的首块
    pub fn is_record_head(&self) -> bool {
        matches!(self.owner, BlockOwner::Unconfirmed | BlockOwner::Confirmed)
    }
}
