//! journal 内部核心状态
//!
//! [`JournalCore`] 独占持有文件、header 权威副本与全部页映射；
//! 所有变更都必须在外层写锁之内、经由事务走
//! 解保护 → 变更 → 提交/中止 → 重保护 的固定序列
//! （由 façade 的 `with_write_txn` 强制执行，新代码路径无法绕过）。
//!
//! 分配器（`balloc`）、记录链表（`list`）与事务管理（`txn`）作为
//! 独立模块在此类型上扩展实现。

use std::fs::File;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::consts::NIL_BLOCK;
use crate::error::{Error, ErrorKind, Result};
use crate::header::JournalHeader;
use crate::mapping::{Geometry, PageMapping};
use crate::txn::Transaction;
use crate::types::{BlockHeader, BlockOwner, RecordHandle};

use super::config::{CommitMode, Mode, ProtectionMode};

/// journal 内部状态（锁之内）
pub(crate) struct JournalCore {
    /// 底层文件
    pub(crate) file: File,
    /// 打开模式
    pub(crate) mode: Mode,
    /// 提交模式
    pub(crate) commit_mode: CommitMode,
    /// 保护模式
    pub(crate) protection_mode: ProtectionMode,
    /// 几何参数（打开后不变）
    pub(crate) geometry: Geometry,
    /// header 权威副本；事务内的修改作用于此，提交时写回映射
    pub(crate) header: JournalHeader,
    /// header 区域映射
    pub(crate) header_map: PageMapping,
    /// 页映射，按页号有序；提交后的页不收缩
    pub(crate) pages: Vec<PageMapping>,
    /// 进行中的事务
    pub(crate) txn: Option<Transaction>,
}

impl JournalCore {
    /// 当前时刻（Unix epoch 起微秒）
    pub(crate) fn now_micros() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    /// 当前已映射的块总数
    pub(crate) fn mapped_blocks(&self) -> u32 {
        self.pages.len() as u32 * self.geometry.blocks_per_page
    }

    /// 句柄必须落在已映射范围内
    pub(crate) fn check_handle_bounds(&self, handle: RecordHandle) -> Result<()> {
        if handle >= self.mapped_blocks() {
            return Err(Error::new(
                ErrorKind::InvalidRecordHandle,
                "handle out of range",
            ));
        }
        Ok(())
    }

    /// 校验句柄指向期望归属的活动记录首块
    pub(crate) fn check_live_record(
        &self,
        handle: RecordHandle,
        expected: Option<BlockOwner>,
    ) -> Result<BlockHeader> {
        self.check_handle_bounds(handle)?;
        let hdr = self.read_block_header(handle)?;
        let ok = match expected {
            Some(owner) => hdr.owner == owner,
            None => hdr.is_record_head(),
        };
        if !ok {
            return Err(Error::new(
                ErrorKind::InvalidRecordHandle,
                "handle does not refer to a live record in the expected list",
            ));
        }
        Ok(hdr)
    }

    /// 读取块头表项
    pub(crate) fn read_block_header(&self, block: u32) -> Result<BlockHeader> {
        let page = self.geometry.page_of_block(block);
        let slot = self.geometry.slot_of_block(block);
        let pm = self.pages.get(page as usize).ok_or(Error::new(
            ErrorKind::Internal,
            "block index beyond mapped pages",
        ))?;
        let bytes = pm.bytes()?;
        BlockHeader::decode(&bytes[self.geometry.header_slot_range(slot)])
    }

    /// 写入块头表项
    ///
    /// 事务内首次覆盖某表项时先把旧字节计入 undo 日志；所属页计入
    /// 脏页集合。事务中止时新增页整页丢弃，因此不为其记录 undo。
    pub(crate) fn write_block_header(&mut self, block: u32, hdr: &BlockHeader) -> Result<()> {
        let page = self.geometry.page_of_block(block);
        let slot = self.geometry.slot_of_block(block);
        let range = self.geometry.header_slot_range(slot);
        let pm = self.pages.get_mut(page as usize).ok_or(Error::new(
            ErrorKind::Internal,
            "block index beyond mapped pages",
        ))?;
        let bytes = pm.bytes_mut()?;
        let slice = &mut bytes[range];
        if let Some(txn) = self.txn.as_mut() {
            txn.record_block_write(block, page, slice);
        }
        hdr.encode(slice);
        Ok(())
    }

    /// 把记录数据按块链顺序写入数据块
    ///
    /// `slices` 逻辑上连续；总长必须不超过 `chain.len() * block_size`。
    pub(crate) fn write_record_data(&mut self, chain: &[u32], slices: &[&[u8]]) -> Result<()> {
        let block_size = self.geometry.block_size as usize;
        let mut chain_pos = 0usize; // 当前块链下标
        let mut block_off = 0usize; // 当前块内偏移
        for slice in slices {
            let mut remaining = *slice;
            while !remaining.is_empty() {
                if block_off == block_size {
                    chain_pos += 1;
                    block_off = 0;
                }
                let block = *chain.get(chain_pos).ok_or(Error::new(
                    ErrorKind::Internal,
                    "record data exceeds allocated chain",
                ))?;
                let take = core::cmp::min(remaining.len(), block_size - block_off);
                let page = self.geometry.page_of_block(block);
                let slot = self.geometry.slot_of_block(block);
                let range = self.geometry.data_slot_range(slot);
                if let Some(txn) = self.txn.as_mut() {
                    txn.mark_page_dirty(page);
                }
                let pm = self.pages.get_mut(page as usize).ok_or(Error::new(
                    ErrorKind::Internal,
                    "block index beyond mapped pages",
                ))?;
                let bytes = pm.bytes_mut()?;
                bytes[range.start + block_off..range.start + block_off + take]
                    .copy_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
                block_off += take;
            }
        }
        Ok(())
    }

    /// 沿块链读出整条记录的数据
    pub(crate) fn read_record_data(&self, head: u32) -> Result<Vec<u8>> {
        let hdr = self.read_block_header(head)?;
        let block_size = self.geometry.block_size as usize;
        let mut out = Vec::with_capacity(hdr.length as usize);
        let mut remaining = hdr.length as usize;
        let mut block = head;
        while remaining > 0 {
            if block == NIL_BLOCK {
                debug_assert!(false, "record chain shorter than record length");
                return Err(Error::new(
                    ErrorKind::Internal,
                    "record chain shorter than record length",
                ));
            }
            let page = self.geometry.page_of_block(block);
            let slot = self.geometry.slot_of_block(block);
            let range = self.geometry.data_slot_range(slot);
            let pm = self.pages.get(page as usize).ok_or(Error::new(
                ErrorKind::Internal,
                "block index beyond mapped pages",
            ))?;
            let bytes = pm.bytes()?;
            let take = core::cmp::min(remaining, block_size);
            out.extend_from_slice(&bytes[range.start..range.start + take]);
            remaining -= take;
            block = self.read_block_header(block)?.next_block;
        }
        Ok(out)
    }

    /// 把 header 权威副本编码进 header 映射
    pub(crate) fn write_header_to_mapping(&mut self) -> Result<()> {
        let bytes = self.header_map.bytes_mut()?;
        self.header
            .encode(&mut bytes[..crate::consts::JOURNAL_HEADER_SIZE]);
        Ok(())
    }

    /// 解除所有映射的保护（已可写的页为 no-op）
    pub(crate) fn unprotect_all(&mut self) -> Result<()> {
        self.header_map.unprotect()?;
        for page in &mut self.pages {
            page.unprotect()?;
        }
        Ok(())
    }

    /// 按保护模式恢复所有映射的保护
    pub(crate) fn protect_all(&mut self) -> Result<()> {
        if self.protection_mode != ProtectionMode::Protected {
            return Ok(());
        }
        self.header_map.protect()?;
        for page in &mut self.pages {
            page.protect()?;
        }
        Ok(())
    }

    /// 同步刷出 header、全部页并 fsync 文件
    ///
    /// 受保护（只读映射）的页没有可刷内容，由 fsync 兜底。
    pub(crate) fn flush_all(&mut self) -> Result<()> {
        self.header_map.flush(true)?;
        for page in &self.pages {
            page.flush(true)?;
        }
        self.file
            .sync_data()
            .map_err(|e| Error::with_cause(ErrorKind::SyncFailure, "fsync failed", e))?;
        Ok(())
    }

    /// 用户数据区域（紧随定长 header）
    pub(crate) fn user_data(&self) -> Result<Vec<u8>> {
        let start = crate::consts::JOURNAL_HEADER_SIZE;
        let len = self.header.user_data_size as usize;
        let bytes = self.header_map.bytes()?;
        Ok(bytes[start..start + len].to_vec())
    }

    /// 覆写用户数据区域前缀
    pub(crate) fn write_user_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.header.user_data_size as usize {
            return Err(Error::new(
                ErrorKind::Full,
                "data exceeds user data region",
            ));
        }
        let start = crate::consts::JOURNAL_HEADER_SIZE;
        let bytes = self.header_map.bytes_mut()?;
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }
}
