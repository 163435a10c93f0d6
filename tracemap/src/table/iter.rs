//! Cursor over a table's entries
//!
//! ```text
//!   Fresh ──first key──▶ Positioned ──next key──▶ Positioned ...
//!     │                      │
//!     │ ENOENT               │ ENOENT
//!     ▼                      ▼
//!  Exhausted             Exhausted        (any other failure: Failed)
//! ```

use std::io;

use log::debug;

use super::map_table::MapTable;
use super::MapBackend;
use crate::domain::TableError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    Positioned,
    Exhausted,
    Failed,
}

/// Single-pass walk over a [`MapTable`] using the kernel's first-key /
/// next-key protocol
///
/// The key and leaf buffers are reused between steps: slices returned by
/// [`key`](Self::key) and [`leaf`](Self::leaf) are only valid until the next
/// [`advance`](Self::advance). No snapshot isolation is provided.
pub struct TableIterator<'a, B: MapBackend> {
    table: &'a MapTable<B>,
    state: State,
    key: Vec<u8>,
    leaf: Vec<u8>,
    err: Option<TableError>,
}

impl<'a, B: MapBackend> TableIterator<'a, B> {
    pub(crate) fn new(table: &'a MapTable<B>) -> Self {
        Self { table, state: State::Fresh, key: Vec::new(), leaf: Vec::new(), err: None }
    }

    /// Move to the next entry; returns false once iteration has ended
    ///
    /// Natural exhaustion leaves [`err`](Self::err) empty.
    pub fn advance(&mut self) -> bool {
        let step = match self.state {
            State::Exhausted | State::Failed => return false,
            State::Fresh => self.start(),
            State::Positioned => self.table.backend().next_key(&mut self.key).map_err(TableError::Io),
        };

        if let Err(e) = step {
            if e.is_not_found() {
                self.state = State::Exhausted;
            } else {
                self.fail(e);
            }
            return false;
        }

        self.state = State::Positioned;
        if let Err(source) = self.table.backend().lookup(&self.key, &mut self.leaf) {
            let key = self.table.render_key(&self.key);
            let err = if source.kind() == io::ErrorKind::NotFound {
                TableError::IterationInconsistency { key }
            } else {
                TableError::Lookup { key, source }
            };
            self.fail(err);
            return false;
        }
        true
    }

    fn start(&mut self) -> Result<(), TableError> {
        let descriptor = self.table.descriptor()?;
        self.key = vec![0u8; descriptor.key_size];
        self.leaf = vec![0u8; self.table.value_size(&descriptor)?];
        debug!("Starting walk over {}", descriptor.id);
        self.table.backend().first_key(&mut self.key).map_err(TableError::Io)
    }

    fn fail(&mut self, err: TableError) {
        debug!("Table walk failed: {err}");
        self.state = State::Failed;
        self.err = Some(err);
    }

    /// Current key, while positioned on an entry
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        (self.state == State::Positioned).then_some(self.key.as_slice())
    }

    /// Current leaf, while positioned on an entry
    #[must_use]
    pub fn leaf(&self) -> Option<&[u8]> {
        (self.state == State::Positioned).then_some(self.leaf.as_slice())
    }

    /// The error that ended iteration, if it did not end naturally
    #[must_use]
    pub fn err(&self) -> Option<&TableError> {
        self.err.as_ref()
    }

    /// Take ownership of the terminal error
    pub fn take_err(&mut self) -> Option<TableError> {
        self.err.take()
    }
}
