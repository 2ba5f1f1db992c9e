//! 持锁记录迭代器
//!
//! 迭代器在其整个生命周期内持有 journal 的读锁：游标指向的记录
//! 不会在迭代期间被移动或释放，代价是写操作被阻塞。
//!
//! # 死锁警告
//!
//! 读写锁不可重入。持有迭代器的线程再调用同一 journal 的任何变更
//! 操作（`add_record`/`confirm_record`/`remove_record`/`close` 等）
//! 会与自己持有的读锁死锁。先 drop 迭代器再变更。

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLockReadGuard;

use crate::consts::NIL_BLOCK;
use crate::error::{Error, ErrorKind, Result};
use crate::journal::core::JournalCore;
use crate::journal::JournalState;
use crate::list::RecordList;
use crate::types::{BlockHeader, BlockOwner, RecordHandle};

/// 沿一条记录链表双向移动的游标
///
/// 由 [`crate::journal::PersistentJournal`] 的
/// `first_confirmed_record` 等方法创建；越过链表任一端后游标失效，
/// 失效的游标不能复位。
pub struct RecordIterator<'a> {
    guard: RwLockReadGuard<'a, JournalState>,
    current: u32,
}

impl<'a> RecordIterator<'a> {
    pub(crate) fn new(
        guard: RwLockReadGuard<'a, JournalState>,
        list: RecordList,
        from_tail: bool,
    ) -> Self {
        let current = match &*guard {
            JournalState::Open(core) => {
                if from_tail {
                    list.tail(&core.header.state)
                } else {
                    list.head(&core.header.state)
                }
            }
            JournalState::Closed => NIL_BLOCK,
        };
        Self { guard, current }
    }

    fn core(&self) -> Option<&JournalCore> {
        match &*self.guard {
            JournalState::Open(core) => Some(core),
            JournalState::Closed => None,
        }
    }

    fn header(&self) -> Result<BlockHeader> {
        let core = self
            .core()
            .ok_or(Error::new(ErrorKind::BadState, "journal is closed"))?;
        if self.current == NIL_BLOCK {
            return Err(Error::new(
                ErrorKind::NotFound,
                "iterator is not positioned on a record",
            ));
        }
        core.read_block_header(self.current)
    }

    /// 游标是否指向一条记录
    pub fn is_valid(&self) -> bool {
        self.current != NIL_BLOCK
    }

    /// 当前记录的句柄
    pub fn handle(&self) -> Option<RecordHandle> {
        (self.current != NIL_BLOCK).then_some(self.current)
    }

    fn step(&mut self, backwards: bool) -> bool {
        if self.current == NIL_BLOCK {
            return false;
        }
        let next = match self.header() {
            Ok(hdr) => {
                if backwards {
                    hdr.prev_record
                } else {
                    hdr.next_record
                }
            }
            Err(_) => NIL_BLOCK,
        };
        self.current = next;
        self.current != NIL_BLOCK
    }

    /// 移向链表后继（更新的记录）；返回移动后是否仍有效
    pub fn advance(&mut self) -> bool {
        self.step(false)
    }

    /// 移向链表前驱（更旧的记录）；返回移动后是否仍有效
    pub fn retreat(&mut self) -> bool {
        self.step(true)
    }

    /// 当前记录的数据
    pub fn data(&self) -> Result<Vec<u8>> {
        let core = self
            .core()
            .ok_or(Error::new(ErrorKind::BadState, "journal is closed"))?;
        if self.current == NIL_BLOCK {
            return Err(Error::new(
                ErrorKind::NotFound,
                "iterator is not positioned on a record",
            ));
        }
        core.read_record_data(self.current)
    }

    /// 当前记录的字节长度
    pub fn record_length(&self) -> Result<u32> {
        Ok(self.header()?.length)
    }

    /// 当前记录的创建时间（UTC）
    pub fn creation_time(&self) -> Result<SystemTime> {
        let hdr = self.header()?;
        Ok(UNIX_EPOCH + Duration::from_micros(hdr.creation_micros))
    }

    /// 当前记录的确认时间（UTC）；未确认记录返回 `BadState`
    pub fn confirmation_time(&self) -> Result<SystemTime> {
        let hdr = self.header()?;
        if hdr.owner != BlockOwner::Confirmed {
            return Err(Error::new(ErrorKind::BadState, "record is not confirmed"));
        }
        Ok(UNIX_EPOCH + Duration::from_micros(hdr.confirmation_micros))
    }

    /// 当前记录是否已确认
    pub fn is_confirmed(&self) -> Result<bool> {
        Ok(self.header()?.owner == BlockOwner::Confirmed)
    }
}
