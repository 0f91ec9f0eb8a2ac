//! Owned result-set view returned to command-tree callbacks.
//!
//! Rows are copied out of the connection's transient read buffer the
//! instant they are decoded, then re-parsed on demand through the same
//! zero-copy `RowDescription`/`DataRow` parsers the wire layer already uses.
//! This sidesteps self-referential-struct problems while still reusing the
//! existing zero-copy machinery for field access.

use crate::conversion::FromRow;
use crate::error::Result;
use crate::protocol::backend::query::{DataRow, FieldDescription, RowDescription};
use crate::protocol::types::FormatCode;

/// A result set accumulated by a single command-tree node.
///
/// Holds the raw `RowDescription` payload (if any) and the raw payload of
/// each `DataRow`, re-parsing them lazily whenever a row or field is
/// accessed.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    description: Option<Vec<u8>>,
    format: FormatCode,
    rows: Vec<Vec<u8>>,
}

impl ResultSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_description(&mut self, payload: &[u8]) {
        self.description = Some(payload.to_vec());
    }

    pub(crate) fn set_format(&mut self, format: FormatCode) {
        self.format = format;
    }

    pub(crate) fn push_row(&mut self, payload: &[u8]) {
        self.rows.push(payload.to_vec());
    }

    /// Whether a row description has been recorded (i.e. the command
    /// produced a result set at all, even if it has zero rows).
    pub fn has_description(&self) -> bool {
        self.description.is_some()
    }

    fn descriptions(&self) -> RowDescription<'_> {
        RowDescription::parse(
            self.description
                .as_deref()
                .expect("descriptions() called on a result set with no RowDescription"),
        )
        .expect("stored RowDescription payload was valid when first captured")
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Random-access row lookup.
    pub fn get(&self, index: usize) -> Option<Row<'_>> {
        self.rows.get(index).map(|payload| Row {
            set: self,
            payload,
        })
    }

    /// Iterate rows, oldest to newest (and back to front, since `Row`'s
    /// iterator supports `DoubleEndedIterator`).
    pub fn iter(&self) -> RowIter<'_> {
        RowIter {
            set: self,
            front: 0,
            back: self.rows.len(),
        }
    }

    /// Bulk-decode every row into `T`, failing with `ArityMismatch` if any
    /// row has fewer fields than `T` requires.
    pub fn rows<T: for<'a> FromRow<'a>>(&self) -> Result<Vec<T>> {
        self.iter().map(|row| row.decode::<T>()).collect()
    }
}

/// A single row within a `ResultSet`.
#[derive(Clone, Copy)]
pub struct Row<'a> {
    set: &'a ResultSet,
    payload: &'a [u8],
}

impl<'a> Row<'a> {
    fn data_row(&self) -> DataRow<'a> {
        DataRow::parse(self.payload).expect("stored DataRow payload was valid when first captured")
    }

    /// Number of fields in this row.
    pub fn len(&self) -> usize {
        self.data_row().len()
    }

    /// Whether this row has no fields.
    pub fn is_empty(&self) -> bool {
        self.data_row().is_empty()
    }

    /// Access a field by column index.
    pub fn field(&self, index: usize) -> Option<Field<'a>> {
        let descriptions = self.set.descriptions();
        let field_desc = *descriptions.fields().get(index)?;
        let raw = self.data_row().get(index)?;
        Some(Field {
            description: field_desc,
            format: self.set.format,
            raw,
        })
    }

    /// Decode this row into `T`.
    pub fn decode<T: for<'b> FromRow<'b>>(&self) -> Result<T> {
        let descriptions = self.set.descriptions();
        match self.set.format {
            FormatCode::Text => T::from_row_text(descriptions.fields(), self.data_row()),
            FormatCode::Binary => T::from_row_binary(descriptions.fields(), self.data_row()),
        }
    }
}

/// A single field within a `Row`.
#[derive(Clone, Copy)]
pub struct Field<'a> {
    description: FieldDescription<'a>,
    format: FormatCode,
    raw: Option<&'a [u8]>,
}

impl<'a> Field<'a> {
    /// The column metadata (name, type OID, etc.) for this field.
    pub fn description(&self) -> FieldDescription<'a> {
        self.description
    }

    /// Whether the value is SQL NULL.
    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// The raw wire bytes for this field, or `None` if NULL.
    pub fn raw(&self) -> Option<&'a [u8]> {
        self.raw
    }

    /// Decode this field into a concrete Rust type.
    pub fn decode<T: crate::conversion::FromWireValue<'a>>(&self) -> Result<T> {
        let oid = self.description.type_oid();
        match self.raw {
            None => T::from_null(),
            Some(bytes) => match self.format {
                FormatCode::Text => T::from_text(oid, bytes),
                FormatCode::Binary => T::from_binary(oid, bytes),
            },
        }
    }
}

/// Bidirectional iterator over the rows of a `ResultSet`.
pub struct RowIter<'a> {
    set: &'a ResultSet,
    front: usize,
    back: usize,
}

impl<'a> Iterator for RowIter<'a> {
    type Item = Row<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        let row = self.set.get(self.front);
        self.front += 1;
        row
    }
}

impl<'a> DoubleEndedIterator for RowIter<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front >= self.back {
            return None;
        }
        self.back -= 1;
        self.set.get(self.back)
    }
}
