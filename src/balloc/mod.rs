//! 空闲块分配
//!
//! 空闲块组成一条经由块头 `next_block` 穿线的单向链表，表头存于
//! StateHeader。分配从表头弹出（LIFO 复用：最近释放的块最先被再次
//! 分配，换取 O(1) 行为，不对复用顺序做任何外部承诺）；空闲块不足
//! 时先 `grow_journal` 映射新页、把新页的块按升序压到表头，再继续
//! 弹出。释放把整条块链借助记录头缓存的 `tail_block` 以 O(1) 拼接
//! 回表头。

use log::{info, warn};

use crate::consts::NIL_BLOCK;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::core::JournalCore;
use crate::mapping::PageMapping;
use crate::types::BlockHeader;

/// 一次分配的结果
pub(crate) struct Allocation {
    /// 分配到的块链，按链序（首块在前）
    pub(crate) blocks: Vec<u32>,
    /// 本次消费到的最高块索引（调用方据此推进 highest_block_used）
    pub(crate) highest: u32,
}

impl JournalCore {
    /// 从空闲链表分配 `num_blocks` 个块
    ///
    /// 空闲块不足时反复增长 journal 直到满足或增长失败
    /// （`Full`/`Mem` 向上传播）。返回的块链已写好续块表项
    /// （`next_block` 依链序相连，末块指向 NIL）；首块表项由调用方
    /// 随后以完整记录头覆盖。
    pub(crate) fn allocate_blocks(&mut self, num_blocks: u32) -> Result<Allocation> {
        debug_assert!(num_blocks > 0);
        while self.header.state.free_blocks < num_blocks as u64 {
            self.grow_journal()?;
        }

        let mut blocks = Vec::with_capacity(num_blocks as usize);
        let mut highest = 0u32;
        let mut cursor = self.header.state.free_head;
        for _ in 0..num_blocks {
            if cursor == NIL_BLOCK {
                debug_assert!(false, "free list shorter than free_blocks count");
                return Err(Error::new(
                    ErrorKind::Internal,
                    "free list shorter than free_blocks count",
                ));
            }
            blocks.push(cursor);
            highest = core::cmp::max(highest, cursor);
            cursor = self.read_block_header(cursor)?.next_block;
        }
        self.header.state.free_head = cursor;
        self.header.state.free_blocks -= num_blocks as u64;

        // 重链块链：弹出的块按弹出顺序组成记录的块链
        for (i, &block) in blocks.iter().enumerate().skip(1) {
            let next = blocks.get(i + 1).copied().unwrap_or(NIL_BLOCK);
            self.write_block_header(block, &BlockHeader::continuation(next))?;
        }

        Ok(Allocation { blocks, highest })
    }

    /// 映射一个新页并把它的块压入空闲链表
    ///
    /// 增长以整页为单位；超出 `max_file_size` 时失败（`Full`），
    /// 建立映射失败时失败（`Mem`）。
    pub(crate) fn grow_journal(&mut self) -> Result<()> {
        let page = self.pages.len() as u32;
        let new_size = self.geometry.file_size_for_pages(page + 1);
        if let Some(limit) = self.header.file_size_limit() {
            if new_size > limit {
                warn!(
                    "[BALLOC] growth to {} bytes would exceed max file size {}",
                    new_size, limit
                );
                return Err(Error::new(ErrorKind::Full, "journal reached max file size"));
            }
        }

        self.file
            .set_len(new_size)
            .map_err(|e| Error::with_cause(ErrorKind::Io, "failed to extend journal file", e))?;
        let mapping = PageMapping::map(
            &self.file,
            self.geometry.page_offset(page),
            self.geometry.page_size(),
            false,
        )?;
        self.pages.push(mapping);

        // 新页的块按升序压到空闲链表头：{base, .., base+n-1, 旧表头...}
        let blocks_per_page = self.geometry.blocks_per_page;
        let base = page * blocks_per_page;
        let old_head = self.header.state.free_head;
        for i in 0..blocks_per_page {
            let next = if i + 1 < blocks_per_page {
                base + i + 1
            } else {
                old_head
            };
            self.write_block_header(base + i, &BlockHeader::free(next))?;
        }
        self.header.state.free_head = base;
        self.header.state.free_blocks += blocks_per_page as u64;
        self.header.state.num_pages = self.pages.len() as u32;

        info!(
            "[BALLOC] grew journal to {} pages, {} free blocks",
            self.pages.len(),
            self.header.state.free_blocks
        );
        Ok(())
    }

    /// 把一条已解链记录的整个块链放回空闲链表（O(1) 拼接）
    ///
    /// 只有首块重新打 Free 标签；续块保持 Continuation 标签留在
    /// 空闲链表中，句柄校验据归属标签仍能拒绝指向它们的陈旧句柄。
    /// 块内容保持未定义状态等待复用。
    pub(crate) fn free_record_blocks(&mut self, head: u32, hdr: &BlockHeader) -> Result<()> {
        let old_head = self.header.state.free_head;
        if hdr.num_blocks <= 1 {
            self.write_block_header(head, &BlockHeader::free(old_head))?;
        } else {
            debug_assert!(hdr.tail_block != NIL_BLOCK);
            self.write_block_header(hdr.tail_block, &BlockHeader::continuation(old_head))?;
            self.write_block_header(head, &BlockHeader::free(hdr.next_block))?;
        }
        self.header.state.free_head = head;
        self.header.state.free_blocks += hdr.num_blocks as u64;
        Ok(())
    }

    /// 按链序收集当前空闲块索引（调试/测试用）
    pub(crate) fn free_block_indices(&self) -> Result<Vec<u32>> {
        let mut out = Vec::with_capacity(self.header.state.free_blocks as usize);
        let mut cursor = self.header.state.free_head;
        while cursor != NIL_BLOCK {
            if out.len() as u64 > self.header.state.free_blocks {
                return Err(Error::new(
                    ErrorKind::Internal,
                    "free list longer than free_blocks count",
                ));
            }
            out.push(cursor);
            cursor = self.read_block_header(cursor)?.next_block;
        }
        Ok(out)
    }
}
