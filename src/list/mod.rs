//! 记录链表操作
//!
//! 未确认/已确认两条双向链表完全存在于磁盘结构里：链接字段是首块
//! 表项的 `prev_record`/`next_record`，头尾指针在 StateHeader 中。
//! 新记录一律追加到尾部，两条链表因此都按进入时间有序（已确认链表
//! 按确认时间有序，淘汰从头部进行即最旧优先）。
//!
//! 这里只维护链接与计数；归属标签、时间戳由调用方在传入的表项上
//! 设置，设置完毕的表项由 [`JournalCore::push_back_record`] 落盘。

use crate::consts::NIL_BLOCK;
use crate::error::Result;
use crate::header::StateHeader;
use crate::journal::core::JournalCore;
use crate::types::BlockHeader;

/// 两条记录链表的选择子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordList {
    Unconfirmed,
    Confirmed,
}

impl RecordList {
    pub(crate) fn head(self, s: &StateHeader) -> u32 {
        match self {
            RecordList::Unconfirmed => s.unconfirmed_head,
            RecordList::Confirmed => s.confirmed_head,
        }
    }

    pub(crate) fn tail(self, s: &StateHeader) -> u32 {
        match self {
            RecordList::Unconfirmed => s.unconfirmed_tail,
            RecordList::Confirmed => s.confirmed_tail,
        }
    }

    fn set_head(self, s: &mut StateHeader, v: u32) {
        match self {
            RecordList::Unconfirmed => s.unconfirmed_head = v,
            RecordList::Confirmed => s.confirmed_head = v,
        }
    }

    fn set_tail(self, s: &mut StateHeader, v: u32) {
        match self {
            RecordList::Unconfirmed => s.unconfirmed_tail = v,
            RecordList::Confirmed => s.confirmed_tail = v,
        }
    }

    /// 记录/块/字节三个计数一起增减
    fn adjust_counts(self, s: &mut StateHeader, records: i64, blocks: i64, bytes: i64) {
        let apply = |v: &mut u64, d: i64| {
            *v = v.wrapping_add(d as u64);
        };
        match self {
            RecordList::Unconfirmed => {
                apply(&mut s.unconfirmed_records, records);
                apply(&mut s.unconfirmed_blocks, blocks);
                apply(&mut s.unconfirmed_bytes, bytes);
            }
            RecordList::Confirmed => {
                apply(&mut s.confirmed_records, records);
                apply(&mut s.confirmed_blocks, blocks);
                apply(&mut s.confirmed_bytes, bytes);
            }
        }
    }
}

impl JournalCore {
    /// 把记录追加到链表尾部并落盘其首块表项
    ///
    /// `hdr` 的归属标签、长度、时间戳等由调用方事先设好；这里补上
    /// `prev_record`/`next_record`，更新前驱尾记录与头尾指针/计数。
    pub(crate) fn push_back_record(
        &mut self,
        list: RecordList,
        head: u32,
        hdr: &mut BlockHeader,
    ) -> Result<()> {
        let old_tail = list.tail(&self.header.state);
        hdr.prev_record = old_tail;
        hdr.next_record = NIL_BLOCK;
        self.write_block_header(head, hdr)?;

        if old_tail == NIL_BLOCK {
            list.set_head(&mut self.header.state, head);
        } else {
            let mut tail_hdr = self.read_block_header(old_tail)?;
            tail_hdr.next_record = head;
            self.write_block_header(old_tail, &tail_hdr)?;
        }
        list.set_tail(&mut self.header.state, head);
        list.adjust_counts(
            &mut self.header.state,
            1,
            hdr.num_blocks as i64,
            hdr.length as i64,
        );
        Ok(())
    }

    /// 把记录从链表中摘除（不动块链，不改归属标签）
    pub(crate) fn unlink_record(&mut self, list: RecordList, hdr: &BlockHeader) -> Result<()> {
        if hdr.prev_record == NIL_BLOCK {
            list.set_head(&mut self.header.state, hdr.next_record);
        } else {
            let mut prev = self.read_block_header(hdr.prev_record)?;
            prev.next_record = hdr.next_record;
            self.write_block_header(hdr.prev_record, &prev)?;
        }
        if hdr.next_record == NIL_BLOCK {
            list.set_tail(&mut self.header.state, hdr.prev_record);
        } else {
            let mut next = self.read_block_header(hdr.next_record)?;
            next.prev_record = hdr.prev_record;
            self.write_block_header(hdr.next_record, &next)?;
        }
        list.adjust_counts(
            &mut self.header.state,
            -1,
            -(hdr.num_blocks as i64),
            -(hdr.length as i64),
        );
        Ok(())
    }
}
