//! 页映射与保护模式
//!
//! journal 文件 = header 区域 + 若干等长页。每页开头是块头表
//! （`blocks_per_page` 个 [`crate::types::BlockHeader`] 表项），随后是
//! `blocks_per_page` 个数据块；页长向上对齐到 `alignment_size`，
//! 因此每个映射的文件偏移都是对齐粒度，满足 mmap 要求。
//!
//! 页按需映射；映射集合是按页号有序的向量，提交后的页在 journal
//! 打开期间不会收缩（事务中止会解除未提交的尾部映射）。
//!
//! 保护模式（PROTECTED）下，页在变更调用之外保持只读映射，通过
//! [`PageMapping::protect`]/[`PageMapping::unprotect`] 在只读/可写
//! 映射之间切换。

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::consts::{align_up, BLOCK_HEADER_SIZE, JOURNAL_HEADER_SIZE};
use crate::error::{Error, ErrorKind, Result};

/// 几何参数：块/页/对齐的纯算术
///
/// 块索引是扁平的、与页无关的编号；给定块索引，所属页与页内槽位
/// 完全由 `blocks_per_page` 算出。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// 块大小（字节）
    pub block_size: u32,
    /// 每页块数
    pub blocks_per_page: u32,
    /// 对齐大小（字节，2 的幂）
    pub alignment_size: u32,
    /// 用户数据区域大小（字节）
    pub user_data_size: u32,
}

impl Geometry {
    /// header 区域在磁盘上的长度（含用户数据，对齐后）
    pub fn header_region_size(&self) -> u64 {
        align_up(
            JOURNAL_HEADER_SIZE as u64 + self.user_data_size as u64,
            self.alignment_size as u64,
        )
    }

    /// 页内块头表长度（字节）
    pub fn table_size(&self) -> usize {
        self.blocks_per_page as usize * BLOCK_HEADER_SIZE
    }

    /// 页在磁盘上的长度（块头表 + 数据块，对齐后）
    pub fn page_size(&self) -> u64 {
        align_up(
            self.table_size() as u64 + self.blocks_per_page as u64 * self.block_size as u64,
            self.alignment_size as u64,
        )
    }

    /// 页的文件偏移
    pub fn page_offset(&self, page: u32) -> u64 {
        self.header_region_size() + page as u64 * self.page_size()
    }

    /// 映射 `num_pages` 页所需的文件长度
    pub fn file_size_for_pages(&self, num_pages: u32) -> u64 {
        self.page_offset(num_pages)
    }

    /// 块索引所属页
    pub fn page_of_block(&self, block: u32) -> u32 {
        block / self.blocks_per_page
    }

    /// 块索引的页内槽位
    pub fn slot_of_block(&self, block: u32) -> u32 {
        block % self.blocks_per_page
    }

    /// 槽位的块头表项在页内的字节范围
    pub fn header_slot_range(&self, slot: u32) -> core::ops::Range<usize> {
        let start = slot as usize * BLOCK_HEADER_SIZE;
        start..start + BLOCK_HEADER_SIZE
    }

    /// 槽位的数据块在页内的字节范围
    pub fn data_slot_range(&self, slot: u32) -> core::ops::Range<usize> {
        let start = self.table_size() + slot as usize * self.block_size as usize;
        start..start + self.block_size as usize
    }

    /// 文件大小上限之内可容纳的页数
    pub fn pages_within(&self, file_size_limit: u64) -> u32 {
        let header = self.header_region_size();
        if file_size_limit <= header {
            return 0;
        }
        ((file_size_limit - header) / self.page_size()) as u32
    }
}

/// 单页（或 header 区域）的映射句柄
///
/// 只读/可写两种映射状态之间切换即保护模式的实现；切换失败时映射
/// 句柄丢失，该页进入不可用状态，任何后续访问返回 `Internal`。
pub struct PageMapping {
    state: Option<MapState>,
}

enum MapState {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl PageMapping {
    /// 建立映射；`protected` 决定初始映射是否只读
    pub fn map(file: &File, offset: u64, len: u64, protected: bool) -> Result<Self> {
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(len as usize);
        let state = if protected {
            let m = unsafe { opts.map(file) }
                .map_err(|e| Error::with_cause(ErrorKind::Mem, "mmap failed", e))?;
            MapState::ReadOnly(m)
        } else {
            let m = unsafe { opts.map_mut(file) }
                .map_err(|e| Error::with_cause(ErrorKind::Mem, "mmap failed", e))?;
            MapState::ReadWrite(m)
        };
        Ok(Self { state: Some(state) })
    }

    /// 是否处于只读（受保护）状态
    pub fn is_protected(&self) -> bool {
        matches!(self.state, Some(MapState::ReadOnly(_)))
    }

    /// 只读访问映射内容
    pub fn bytes(&self) -> Result<&[u8]> {
        match &self.state {
            Some(MapState::ReadOnly(m)) => Ok(&m[..]),
            Some(MapState::ReadWrite(m)) => Ok(&m[..]),
            None => Err(Error::new(ErrorKind::Internal, "page mapping poisoned")),
        }
    }

    /// 可写访问映射内容（页必须已解除保护）
    pub fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match &mut self.state {
            Some(MapState::ReadWrite(m)) => Ok(&mut m[..]),
            Some(MapState::ReadOnly(_)) => Err(Error::new(
                ErrorKind::Internal,
                "write to protected page",
            )),
            None => Err(Error::new(ErrorKind::Internal, "page mapping poisoned")),
        }
    }

    /// 切换到只读映射
    pub fn protect(&mut self) -> Result<()> {
        match self.state.take() {
            Some(MapState::ReadWrite(m)) => match m.make_read_only() {
                Ok(ro) => {
                    self.state = Some(MapState::ReadOnly(ro));
                    Ok(())
                }
                Err(e) => Err(Error::with_cause(
                    ErrorKind::ProtectionFailure,
                    "failed to re-protect page",
                    e,
                )),
            },
            Some(other) => {
                self.state = Some(other);
                Ok(())
            }
            None => Err(Error::new(ErrorKind::Internal, "page mapping poisoned")),
        }
    }

    /// 切换到可写映射
    pub fn unprotect(&mut self) -> Result<()> {
        match self.state.take() {
            Some(MapState::ReadOnly(m)) => match m.make_mut() {
                Ok(rw) => {
                    self.state = Some(MapState::ReadWrite(rw));
                    Ok(())
                }
                Err(e) => Err(Error::with_cause(
                    ErrorKind::ProtectionFailure,
                    "failed to unprotect page",
                    e,
                )),
            },
            Some(other) => {
                self.state = Some(other);
                Ok(())
            }
            None => Err(Error::new(ErrorKind::Internal, "page mapping poisoned")),
        }
    }

    /// 将映射内容刷入磁盘
    ///
    /// `sync` 为 true 时同步等待（msync），否则仅调度异步写回。
    /// 只读映射没有待刷内容，直接成功。
    pub fn flush(&self, sync: bool) -> Result<()> {
        if let Some(MapState::ReadWrite(m)) = &self.state {
            let r = if sync { m.flush() } else { m.flush_async() };
            r.map_err(|e| Error::with_cause(ErrorKind::SyncFailure, "msync failed", e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn geom() -> Geometry {
        Geometry {
            block_size: 32,
            blocks_per_page: 4,
            alignment_size: 4096,
            user_data_size: 0,
        }
    }

    #[test]
    fn test_header_region_alignment() {
        let g = geom();
        assert_eq!(g.header_region_size(), 4096);
        let g2 = Geometry {
            user_data_size: 5000,
            ..g
        };
        assert_eq!(g2.header_region_size(), 8192);
    }

    #[test]
    fn test_page_geometry() {
        let g = geom();
        // 表 4*48 + 数据 4*32 = 320，对齐到 4096
        assert_eq!(g.table_size(), 192);
        assert_eq!(g.page_size(), 4096);
        assert_eq!(g.page_offset(0), 4096);
        assert_eq!(g.page_offset(2), 4096 + 2 * 4096);
    }

    #[test]
    fn test_block_arithmetic() {
        let g = geom();
        assert_eq!(g.page_of_block(0), 0);
        assert_eq!(g.page_of_block(3), 0);
        assert_eq!(g.page_of_block(4), 1);
        assert_eq!(g.slot_of_block(6), 2);
        assert_eq!(g.header_slot_range(1), 48..96);
        assert_eq!(g.data_slot_range(1), 192 + 32..192 + 64);
    }

    #[test]
    fn test_pages_within_limit() {
        let g = geom();
        assert_eq!(g.pages_within(4096), 0);
        assert_eq!(g.pages_within(8192), 1);
        assert_eq!(g.pages_within(8191), 0);
        assert_eq!(g.pages_within(3 * 4096), 2);
    }

    #[test]
    fn test_mapping_protect_cycle() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; 8192]).unwrap();
        let mut m = PageMapping::map(&f, 0, 4096, false).unwrap();
        m.bytes_mut().unwrap()[0] = 0xAB;
        m.protect().unwrap();
        assert!(m.is_protected());
        assert!(m.bytes_mut().is_err());
        assert_eq!(m.bytes().unwrap()[0], 0xAB);
        m.unprotect().unwrap();
        assert!(!m.is_protected());
        m.bytes_mut().unwrap()[1] = 0xCD;
        m.flush(true).unwrap();
    }
}
