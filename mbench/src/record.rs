use rand::Rng;
use thiserror::Error;

use crate::value::{TypedValue, ValueType};

const SYLLABLES: [&str; 10] = [
    "BAR", "OUGHT", "ABLE", "PRI", "PRES", "ESE", "ANTI", "CALLY", "ATION", "EING",
];

/// Columns repeat their types in blocks of ten.
pub const COLUMN_BLOCK: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("field {position} is out of range for a record of {arity} fields")]
    FieldOutOfRange { position: usize, arity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Double,
    Int,
    Short,
    Long,
    /// A string made of this many syllables.
    Text(usize),
}

impl ColumnType {
    #[must_use]
    pub const fn for_column(column: usize) -> Self {
        match column % COLUMN_BLOCK {
            0 | 7 => Self::Double,
            1 | 2 => Self::Int,
            3 | 4 => Self::Short,
            5 | 6 => Self::Long,
            8 => Self::Text(2),
            _ => Self::Text(3),
        }
    }

    #[must_use]
    pub const fn value_type(self) -> ValueType {
        match self {
            Self::Double => ValueType::Double,
            Self::Int => ValueType::Int,
            Self::Short => ValueType::Short,
            Self::Long => ValueType::Long,
            Self::Text(_) => ValueType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Option<TypedValue>,
}

/// One benchmark row. Fields without a value are left untouched by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<Field>,
}

impl Record {
    #[must_use]
    pub fn new(num_columns: usize) -> Self {
        Self {
            fields: (0..num_columns)
                .map(|i| Field {
                    name: column_name(i),
                    value: None,
                })
                .collect(),
        }
    }

    pub fn random_insert<R: Rng + ?Sized>(rng: &mut R, num_columns: usize) -> Self {
        let mut record = Self::new(num_columns);

        for (i, field) in record.fields.iter_mut().enumerate() {
            field.value = Some(random_value(rng, i));
        }

        record
    }

    /// Sets one field of each type pair inside a randomly chosen block of ten columns.
    pub fn random_update<R: Rng + ?Sized>(rng: &mut R, num_columns: usize) -> Self {
        let mut record = Self::new(num_columns);

        let blocks = (num_columns / COLUMN_BLOCK).max(1);
        let offset = COLUMN_BLOCK * rng.random_range(0..blocks);

        for (first, second) in [(0, 7), (1, 2), (3, 4), (5, 6), (8, 9)] {
            let column = offset + if rng.random_range(0..10) <= 5 { first } else { second };

            if column < num_columns {
                record.fields[column].value = Some(random_value(rng, column));
            }
        }

        record
    }

    pub fn set_field(&mut self, position: usize, value: TypedValue) -> Result<(), RecordError> {
        let arity = self.arity();
        let field = self
            .fields
            .get_mut(position)
            .ok_or(RecordError::FieldOutOfRange { position, arity })?;

        field.value = Some(value);

        Ok(())
    }

    /// Copies every field that is set in `update` over this record.
    pub fn apply_update(&mut self, update: &Self) -> Result<(), RecordError> {
        for (position, field) in update.fields.iter().enumerate() {
            if let Some(value) = &field.value {
                self.set_field(position, value.clone())?;
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn get(&self, position: usize) -> Option<&TypedValue> {
        self.fields.get(position)?.value.as_ref()
    }
}

#[must_use]
pub fn column_name(column: usize) -> String {
    format!("A{column}")
}

fn random_value<R: Rng + ?Sized>(rng: &mut R, column: usize) -> TypedValue {
    match column % COLUMN_BLOCK {
        0 => TypedValue::Double(rng.random()),
        1 => TypedValue::Int(rng.random()),
        2 => TypedValue::Int(rng.random_range(0..10_000)),
        3 => TypedValue::Short(rng.random_range(0..2)),
        4 => TypedValue::Short(rng.random_range(0..256)),
        5 => TypedValue::Long(rng.random_range(i64::MIN..0)),
        6 => TypedValue::Long(rng.random()),
        7 => TypedValue::Double(rng.random_range(f64::MIN_POSITIVE..f64::MAX)),
        8 => TypedValue::String(random_text(rng, 2)),
        _ => TypedValue::String(random_text(rng, 3)),
    }
}

fn random_text<R: Rng + ?Sized>(rng: &mut R, syllables: usize) -> String {
    (0..syllables)
        .map(|_| SYLLABLES[rng.random_range(0..SYLLABLES.len())])
        .collect()
}
