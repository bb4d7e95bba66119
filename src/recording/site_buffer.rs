//! Per-site buffer of the latest events
//!
//! Holds the most recent occurrences of one event site as three parallel
//! columns (value, sequence number, thread id). The buffer starts small,
//! doubles until it reaches its logical limit `buffer_size`, and from then on
//! behaves as a ring that overwrites its oldest slot.
//!
//! Unlike a plain ring buffer the limit is not fixed: the budget controller
//! lowers it with [`SiteBuffer::trim_oldest`] / [`SiteBuffer::ensure_at_most`],
//! which physically drop the oldest events and release their storage.
//!
//! ```text
//!  growing:  [e0 e1 e2 .. ..]          head = 0, len < capacity
//!  ring:     [e4 e5 e2 e3]             head = 2 (oldest), len = capacity = buffer_size
//!  trimmed:  [e3 e4 e5]                head = 0, buffer_size lowered by the trim
//! ```

use crate::recording::retention::{RetentionPolicy, COLLECTED_SENTINEL};
use crate::recording::value::{identity_of, ObjectId, ObjectSlot, Resolved, Value, ValueKind};
use crate::utils::errors::{Result, TraceError};
use serde::Serialize;
use serde_json::json;

/// Slots allocated when a buffer is created (or its limit, if smaller)
pub const INITIAL_CAPACITY: usize = 32;

/// Value column, one variant per stored kind
enum Column {
    Boolean(Vec<bool>),
    Byte(Vec<i8>),
    Char(Vec<u16>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Object(Vec<ObjectSlot>),
    ObjectId(Vec<ObjectId>),
}

macro_rules! each_column {
    ($column:expr, $v:ident => $body:expr) => {
        match $column {
            Column::Boolean($v) => $body,
            Column::Byte($v) => $body,
            Column::Char($v) => $body,
            Column::Short($v) => $body,
            Column::Int($v) => $body,
            Column::Long($v) => $body,
            Column::Float($v) => $body,
            Column::Double($v) => $body,
            Column::Object($v) => $body,
            Column::ObjectId($v) => $body,
        }
    };
}

fn reserve<T>(v: &mut Vec<T>, new_len: usize) -> Result<()> {
    v.try_reserve_exact(new_len.saturating_sub(v.len()))
        .map_err(|source| TraceError::AllocationFailed {
            requested: new_len,
            source,
        })
}

/// Rotate the oldest slot to index 0 and extend with empty slots
fn linearize_and_extend<T: Clone + Default>(v: &mut Vec<T>, head: usize, new_len: usize) {
    v.rotate_left(head);
    v.resize(new_len, T::default());
}

/// Drop the `drop` oldest slots and release everything past `keep`
fn compact<T>(v: &mut Vec<T>, head: usize, drop: usize, keep: usize) {
    v.rotate_left(head);
    v.drain(..drop);
    v.truncate(keep);
    v.shrink_to_fit();
}

impl Column {
    fn with_len(kind: ValueKind, len: usize) -> Result<Self> {
        fn filled<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
            let mut v = Vec::new();
            reserve(&mut v, len)?;
            v.resize(len, T::default());
            Ok(v)
        }

        Ok(match kind.storage_kind() {
            ValueKind::Boolean => Column::Boolean(filled(len)?),
            ValueKind::Byte => Column::Byte(filled(len)?),
            ValueKind::Char => Column::Char(filled(len)?),
            ValueKind::Short => Column::Short(filled(len)?),
            ValueKind::Int | ValueKind::Void => Column::Int(filled(len)?),
            ValueKind::Long => Column::Long(filled(len)?),
            ValueKind::Float => Column::Float(filled(len)?),
            ValueKind::Double => Column::Double(filled(len)?),
            ValueKind::Object => Column::Object(filled(len)?),
            ValueKind::ObjectId => Column::ObjectId(filled(len)?),
        })
    }

    fn kind(&self) -> ValueKind {
        match self {
            Column::Boolean(_) => ValueKind::Boolean,
            Column::Byte(_) => ValueKind::Byte,
            Column::Char(_) => ValueKind::Char,
            Column::Short(_) => ValueKind::Short,
            Column::Int(_) => ValueKind::Int,
            Column::Long(_) => ValueKind::Long,
            Column::Float(_) => ValueKind::Float,
            Column::Double(_) => ValueKind::Double,
            Column::Object(_) => ValueKind::Object,
            Column::ObjectId(_) => ValueKind::ObjectId,
        }
    }

    fn reserve(&mut self, new_len: usize) -> Result<()> {
        each_column!(self, v => reserve(v, new_len))
    }

    fn linearize_and_extend(&mut self, head: usize, new_len: usize) {
        each_column!(self, v => linearize_and_extend(v, head, new_len))
    }

    fn compact(&mut self, head: usize, drop: usize, keep: usize) {
        each_column!(self, v => compact(v, head, drop, keep))
    }

    /// Store a value whose kind was already checked against the column
    fn store(&mut self, idx: usize, value: Value, retention: RetentionPolicy) {
        match (self, value) {
            (Column::Boolean(v), Value::Boolean(x)) => v[idx] = x,
            (Column::Byte(v), Value::Byte(x)) => v[idx] = x,
            (Column::Char(v), Value::Char(x)) => v[idx] = x,
            (Column::Short(v), Value::Short(x)) => v[idx] = x,
            (Column::Int(v), Value::Int(x)) => v[idx] = x,
            (Column::Long(v), Value::Long(x)) => v[idx] = x,
            (Column::Float(v), Value::Float(x)) => v[idx] = x,
            (Column::Double(v), Value::Double(x)) => v[idx] = x,
            (Column::Object(v), Value::Object(x)) => v[idx] = retention.hold(x),
            (Column::ObjectId(v), Value::ObjectId(x)) => v[idx] = x,
            _ => unreachable!("value kind is checked before store"),
        }
    }

    fn load(&self, idx: usize) -> Value {
        match self {
            Column::Boolean(v) => Value::Boolean(v[idx]),
            Column::Byte(v) => Value::Byte(v[idx]),
            Column::Char(v) => Value::Char(v[idx]),
            Column::Short(v) => Value::Short(v[idx]),
            Column::Int(v) => Value::Int(v[idx]),
            Column::Long(v) => Value::Long(v[idx]),
            Column::Float(v) => Value::Float(v[idx]),
            Column::Double(v) => Value::Double(v[idx]),
            Column::Object(v) => match v[idx].resolve() {
                Resolved::Live(o) => Value::Object(Some(o)),
                Resolved::Null | Resolved::Collected => Value::Object(None),
            },
            Column::ObjectId(v) => Value::ObjectId(v[idx].clone()),
        }
    }

    fn csv_cell(&self, idx: usize) -> String {
        match self {
            Column::Boolean(v) => v[idx].to_string(),
            Column::Byte(v) => v[idx].to_string(),
            Column::Char(v) => v[idx].to_string(),
            Column::Short(v) => v[idx].to_string(),
            Column::Int(v) => v[idx].to_string(),
            Column::Long(v) => v[idx].to_string(),
            Column::Float(v) => format!("{:?}", v[idx]),
            Column::Double(v) => format!("{:?}", v[idx]),
            Column::Object(v) => match v[idx].resolve() {
                Resolved::Null => "null".to_string(),
                Resolved::Collected => COLLECTED_SENTINEL.to_string(),
                Resolved::Live(o) => {
                    let id = format!("{}@{:x}", o.type_name(), identity_of(&o));
                    match o.text_content() {
                        Some(text) => format!("{}:{}", id, escape_text(text)),
                        None => id,
                    }
                }
            },
            Column::ObjectId(v) => {
                let oid = &v[idx];
                let id = format!("{}@{}", oid.type_name, oid.id);
                match &oid.content {
                    Some(text) => format!("{}:{}", id, escape_text(text)),
                    None => id,
                }
            }
        }
    }

    fn json_value(&self, idx: usize) -> serde_json::Value {
        match self {
            Column::Boolean(v) => json!(v[idx]),
            Column::Byte(v) => json!(v[idx]),
            Column::Char(v) => json!(v[idx]),
            Column::Short(v) => json!(v[idx]),
            Column::Int(v) => json!(v[idx]),
            Column::Long(v) => json!(v[idx]),
            Column::Float(v) => json!(v[idx]),
            Column::Double(v) => json!(v[idx]),
            Column::Object(v) => match v[idx].resolve() {
                Resolved::Null => serde_json::Value::Null,
                Resolved::Collected => json!({ "id": COLLECTED_SENTINEL }),
                Resolved::Live(o) => {
                    let mut obj = json!({
                        "id": format!("{:x}", identity_of(&o)),
                        "type": o.type_name(),
                    });
                    if let Some(text) = o.text_content() {
                        obj["str"] = json!(text);
                    }
                    obj
                }
            },
            Column::ObjectId(v) => {
                let oid = &v[idx];
                let mut obj = json!({
                    "id": oid.id.to_string(),
                    "type": &*oid.type_name,
                });
                if let Some(text) = &oid.content {
                    obj["str"] = json!(&**text);
                }
                obj
            }
        }
    }
}

/// JSON-style escaping of captured text, without the surrounding quotes
fn escape_text(text: &str) -> String {
    let quoted = serde_json::Value::String(text.to_owned()).to_string();
    quoted[1..quoted.len() - 1].to_owned()
}

/// Buffer contents in the structured trace layout
#[derive(Debug, Clone, Serialize)]
pub struct BufferColumns {
    pub freq: u64,
    pub record: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Vec<serde_json::Value>>,
    pub seqnum: Vec<u64>,
    pub thread: Vec<u32>,
}

impl BufferColumns {
    /// Columns of a site that never recorded anything
    pub fn empty(skip_values: bool) -> Self {
        Self {
            freq: 0,
            record: 0,
            value: (!skip_values).then(Vec::new),
            seqnum: Vec::new(),
            thread: Vec::new(),
        }
    }
}

/// Latest-events buffer for a single site
pub struct SiteBuffer {
    column: Column,
    seqnums: Vec<u64>,
    threads: Vec<u32>,
    /// Physical index of the oldest retrievable slot
    head: usize,
    /// Retrievable slots
    len: usize,
    /// Events offered to this buffer, less those trimmed
    count: u64,
    /// Current logical limit; never below 1
    buffer_size: usize,
    retention: RetentionPolicy,
}

impl SiteBuffer {
    /// Create a buffer for `kind` values with logical limit `buffer_size`
    pub fn new(kind: ValueKind, buffer_size: usize, retention: RetentionPolicy) -> Result<Self> {
        let buffer_size = buffer_size.max(1);
        let capacity = INITIAL_CAPACITY.min(buffer_size);

        let column = Column::with_len(kind, capacity)?;
        let mut seqnums = Vec::new();
        reserve(&mut seqnums, capacity)?;
        seqnums.resize(capacity, 0);
        let mut threads = Vec::new();
        reserve(&mut threads, capacity)?;
        threads.resize(capacity, 0);

        Ok(Self {
            column,
            seqnums,
            threads,
            head: 0,
            len: 0,
            count: 0,
            buffer_size,
            retention,
        })
    }

    /// Kind of the values stored in this buffer
    pub fn kind(&self) -> ValueKind {
        self.column.kind()
    }

    /// Number of retrievable events
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Events offered to this buffer (reduced by explicit trims only)
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Allocated slots
    pub fn capacity(&self) -> usize {
        self.seqnums.len()
    }

    /// Current logical limit
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Store an event, overwriting the oldest one once the buffer is full
    ///
    /// Returns the number of retrievable slots gained (0 when a ring
    /// overwrite happened, 1 otherwise).
    pub fn add(&mut self, value: Value, seqnum: u64, thread: u32) -> Result<usize> {
        let actual = value.kind();
        let expected = self.kind();
        if actual != expected {
            debug_assert!(
                false,
                "site buffer holds {:?} values, got {:?}",
                expected, actual
            );
            return Err(TraceError::KindMismatch { expected, actual });
        }

        let capacity = self.capacity();
        let (idx, gained) = if self.len < capacity {
            ((self.head + self.len) % capacity, 1)
        } else if capacity < self.buffer_size {
            self.grow((capacity * 2).max(1).min(self.buffer_size))?;
            (self.len, 1)
        } else {
            let idx = self.head;
            self.head = (self.head + 1) % capacity;
            (idx, 0)
        };

        self.column.store(idx, value, self.retention);
        self.seqnums[idx] = seqnum;
        self.threads[idx] = thread;
        self.len += gained;
        self.count += 1;

        Ok(gained)
    }

    fn grow(&mut self, new_capacity: usize) -> Result<()> {
        // Reserve all three columns before touching any, so a failure leaves
        // the buffer consistent.
        self.column.reserve(new_capacity)?;
        reserve(&mut self.seqnums, new_capacity)?;
        reserve(&mut self.threads, new_capacity)?;

        self.column.linearize_and_extend(self.head, new_capacity);
        linearize_and_extend(&mut self.seqnums, self.head, new_capacity);
        linearize_and_extend(&mut self.threads, self.head, new_capacity);
        self.head = 0;
        Ok(())
    }

    /// Physically remove the `n` oldest events
    ///
    /// The logical limit and `count` drop by the same amount, so the buffer's
    /// ceiling shrinks permanently. Returns the number of events removed.
    pub fn trim_oldest(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == 0 {
            return 0;
        }

        let keep = self.len - n;
        self.column.compact(self.head, n, keep);
        compact(&mut self.seqnums, self.head, n, keep);
        compact(&mut self.threads, self.head, n, keep);

        self.head = 0;
        self.len = keep;
        self.count = self.count.saturating_sub(n as u64);
        self.buffer_size = (self.buffer_size - n).max(1);
        n
    }

    /// Trim down to at most `max_size` events and cap the limit there
    ///
    /// A bound of 0 is treated as 1. Returns the number of events removed.
    pub fn ensure_at_most(&mut self, max_size: usize) -> usize {
        let max_size = max_size.max(1);
        let removed = if self.len > max_size {
            self.trim_oldest(self.len - max_size)
        } else {
            0
        };

        if self.buffer_size > max_size {
            self.buffer_size = max_size;
            if self.capacity() > max_size {
                let (head, len) = (self.head, self.len);
                self.column.compact(head, 0, len);
                compact(&mut self.seqnums, head, 0, len);
                compact(&mut self.threads, head, 0, len);
                self.head = 0;
            }
        }

        removed
    }

    fn pos(&self, i: usize) -> Option<usize> {
        (i < self.len).then(|| (self.head + i) % self.capacity())
    }

    /// Value of the `i`-th retrievable event (0 = oldest)
    ///
    /// Collected weak references read back as `Value::Object(None)`.
    pub fn get(&self, i: usize) -> Option<Value> {
        self.pos(i).map(|p| self.column.load(p))
    }

    pub fn seqnum(&self, i: usize) -> Option<u64> {
        self.pos(i).map(|p| self.seqnums[p])
    }

    pub fn thread_id(&self, i: usize) -> Option<u32> {
        self.pos(i).map(|p| self.threads[p])
    }

    /// Retrievable values, oldest first
    pub fn values(&self) -> Vec<Value> {
        (0..self.len).filter_map(|i| self.get(i)).collect()
    }

    /// Retrievable sequence numbers, oldest first
    pub fn seqnums(&self) -> Vec<u64> {
        (0..self.len).filter_map(|i| self.seqnum(i)).collect()
    }

    /// CSV header cells for `width` event slots
    pub fn column_names(width: usize) -> Vec<String> {
        let mut names = Vec::with_capacity(2 + 3 * width);
        names.push("freq".to_string());
        names.push("record".to_string());
        for i in 1..=width {
            names.push(format!("value{}", i));
            names.push(format!("seqnum{}", i));
            names.push(format!("thread{}", i));
        }
        names
    }

    /// Placeholder cells for a site without a buffer
    pub fn empty_cells(width: usize) -> Vec<String> {
        vec![String::new(); 2 + 3 * width]
    }

    /// CSV cells: freq, record, then one value/seqnum/thread triple per slot
    ///
    /// Slots past the retrievable events are padded with empty cells up to
    /// `width` so every row has the same column count.
    pub fn csv_cells(&self, width: usize) -> Vec<String> {
        let slots = width.max(self.len);
        let mut cells = Vec::with_capacity(2 + 3 * slots);
        cells.push(self.count.to_string());
        cells.push(self.len.to_string());
        for i in 0..slots {
            match self.pos(i) {
                Some(p) => {
                    cells.push(self.column.csv_cell(p));
                    cells.push(self.seqnums[p].to_string());
                    cells.push(self.threads[p].to_string());
                }
                None => cells.extend(std::iter::repeat(String::new()).take(3)),
            }
        }
        cells
    }

    /// Structured columns; `skip_values` omits the value array (void sites)
    pub fn columns(&self, skip_values: bool) -> BufferColumns {
        let positions: Vec<usize> = (0..self.len).filter_map(|i| self.pos(i)).collect();
        BufferColumns {
            freq: self.count,
            record: self.len,
            value: (!skip_values)
                .then(|| positions.iter().map(|&p| self.column.json_value(p)).collect()),
            seqnum: positions.iter().map(|&p| self.seqnums[p]).collect(),
            thread: positions.iter().map(|&p| self.threads[p]).collect(),
        }
    }
}

impl std::fmt::Debug for SiteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteBuffer")
            .field("kind", &self.kind())
            .field("size", &self.len)
            .field("count", &self.count)
            .field("capacity", &self.capacity())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}
