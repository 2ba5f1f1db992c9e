//! 事务系统
//!
//! 状态机：Idle → InTransaction（每个变更 façade 操作入口调用
//! `begin_transaction`）→ Idle（成功路径 `commit_transaction`，失败
//! 路径 `abort_transaction`）。
//!
//! 与其把回滚寄托在"从磁盘重读页"的尽力而为上，这里采用精确的
//! undo 日志：事务内首次覆盖某个块头表项时记下旧字节，中止时原样
//! 写回，并把 header 权威副本恢复为事务开始时的快照、解除未提交的
//! 新增页映射。数据块内容不入日志——回滚后这些块回到空闲链表，
//! 内容本就未定义。
//!
//! 提交路径上的 I/O 错误（msync 失败）**不会**触发回滚：此时内存
//! 状态保持为已应用的样子，调用方应当关闭 journal 并重新打开校验。

use std::collections::{BTreeMap, BTreeSet};

use crate::consts::BLOCK_HEADER_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::header::JournalHeader;
use crate::journal::config::CommitMode;
use crate::journal::core::JournalCore;

/// 进行中事务的回滚与脏页信息
pub(crate) struct Transaction {
    /// 事务开始时的 header 快照
    header_snapshot: JournalHeader,
    /// 事务开始时已映射的页数；超出部分在中止时整页丢弃
    pages_snapshot: usize,
    /// 块头 undo 日志：块索引 → 事务前的表项字节
    undo: BTreeMap<u32, [u8; BLOCK_HEADER_SIZE]>,
    /// 本事务触碰过的页
    dirty_pages: BTreeSet<u32>,
}

impl Transaction {
    pub(crate) fn new(header_snapshot: JournalHeader, pages_snapshot: usize) -> Self {
        Self {
            header_snapshot,
            pages_snapshot,
            undo: BTreeMap::new(),
            dirty_pages: BTreeSet::new(),
        }
    }

    /// 登记一次块头覆盖：`prior` 是覆盖前的表项字节
    pub(crate) fn record_block_write(&mut self, block: u32, page: u32, prior: &[u8]) {
        self.dirty_pages.insert(page);
        if (page as usize) < self.pages_snapshot && !self.undo.contains_key(&block) {
            let mut saved = [0u8; BLOCK_HEADER_SIZE];
            saved.copy_from_slice(prior);
            self.undo.insert(block, saved);
        }
    }

    /// 登记脏页（数据块写入，不需要 undo）
    pub(crate) fn mark_page_dirty(&mut self, page: u32) {
        self.dirty_pages.insert(page);
    }
}

impl JournalCore {
    /// 开始事务
    ///
    /// 变更操作入口处调用；嵌套事务是内部 bug。
    pub(crate) fn begin_transaction(&mut self) {
        debug_assert!(self.txn.is_none(), "nested transaction");
        self.txn = Some(Transaction::new(self.header, self.pages.len()));
    }

    /// 提交事务
    ///
    /// 把 header 权威副本写回映射；EXPLICIT_COMMIT（或 `force_sync`，
    /// 即公共 `commit()` 路径）下同步刷出 header 与所有脏页。
    /// IMPLICIT_COMMIT 下由 OS 决定何时落盘。
    pub(crate) fn commit_transaction(&mut self, force_sync: bool) -> Result<()> {
        let txn = self.txn.take().ok_or(Error::new(
            ErrorKind::Internal,
            "commit without transaction",
        ))?;
        self.write_header_to_mapping()?;
        if force_sync || self.commit_mode == CommitMode::Explicit {
            self.header_map.flush(true)?;
            for &page in &txn.dirty_pages {
                match self.pages.get(page as usize) {
                    Some(pm) => pm.flush(true)?,
                    None => {
                        debug_assert!(false, "dirty page beyond mapped pages");
                        return Err(Error::new(
                            ErrorKind::Internal,
                            "dirty page beyond mapped pages",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// 中止事务：精确回滚内存状态
    ///
    /// 先丢弃未提交的新增页映射，再把 undo 日志写回剩余页，最后
    /// 恢复 header 快照。回滚过程中的写入失败只记日志（此时页仍
    /// 处于解保护状态，失败意味着映射已中毒，属于 bug 级别状态）。
    pub(crate) fn abort_transaction(&mut self) {
        let Some(txn) = self.txn.take() else {
            debug_assert!(false, "abort without transaction");
            return;
        };
        self.pages.truncate(txn.pages_snapshot);
        for (&block, prior) in &txn.undo {
            if let Err(e) = self.restore_block_header_bytes(block, prior) {
                log::error!("[TXN] failed to roll back block {}: {}", block, e);
            }
        }
        self.header = txn.header_snapshot;
        log::debug!(
            "[TXN] aborted: {} header slots restored, {} dirty pages discarded",
            txn.undo.len(),
            txn.dirty_pages.len()
        );
    }

    /// 原样写回一个块头表项的旧字节
    fn restore_block_header_bytes(&mut self, block: u32, prior: &[u8]) -> Result<()> {
        let page = self.geometry.page_of_block(block);
        let slot = self.geometry.slot_of_block(block);
        let range = self.geometry.header_slot_range(slot);
        let pm = self.pages.get_mut(page as usize).ok_or(Error::new(
            ErrorKind::Internal,
            "undo entry beyond mapped pages",
        ))?;
        let bytes = pm.bytes_mut()?;
        bytes[range].copy_from_slice(prior);
        Ok(())
    }
}
