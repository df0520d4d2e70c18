//! Column-major ("struct of arrays") tables.
//!
//! Every table holds one `Vec` per column plus an authoritative `length`. Rows are appended only
//! through the generated `push`, which writes one value to every column and then bumps `length`,
//! so all columns stay in lockstep. Optional columns are `None` for the whole table or present
//! for every row; whether a column is present is decided before the first row is pushed.

use crate::error::ProcessError;

pub trait ColumnarTable {
    /// The table name used in diagnostics.
    const NAME: &'static str;

    /// The number of rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The name and length of every present column.
    fn column_lengths(&self) -> Vec<(&'static str, usize)>;

    /// Check that every column has exactly `len()` entries.
    ///
    /// A mismatch means the table was corrupted while being built and the conversion cannot
    /// continue.
    fn check_lengths(&self) -> Result<(), ProcessError> {
        let expected = self.len();
        match self
            .column_lengths()
            .into_iter()
            .find(|(_, actual)| *actual != expected)
        {
            Some((column, actual)) => Err(ProcessError::TableLength {
                table: Self::NAME,
                column,
                expected,
                actual,
            }),
            None => Ok(()),
        }
    }
}

/// Define a columnar table `$name` together with its row type `$row`.
///
/// Columns listed in the `optional` block are stored as `Option<Vec<_>>` and are skipped when
/// serializing if absent.
macro_rules! columnar_table {
    (
        $(#[$meta:meta])*
        pub struct $name:ident / $row:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
        $( optional {
            $( $(#[$ometa:meta])* $ofield:ident : $oty:ty ),* $(,)?
        } )?
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: Vec<$ty>, )*
            $($(
                $(#[$ometa])*
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $ofield: Option<Vec<$oty>>,
            )*)?
            pub length: usize,
        }

        #[derive(Clone, Debug, Default, PartialEq)]
        pub struct $row {
            $( pub $field: $ty, )*
            $($( pub $ofield: $oty, )*)?
        }

        impl $name {
            pub fn empty() -> Self {
                Self::default()
            }

            /// A copy with new column vectors holding the same elements.
            pub fn clone_shallow(&self) -> Self {
                self.clone()
            }

            /// Append `row` and return its index.
            pub fn push(&mut self, row: $row) -> usize {
                $( self.$field.push(row.$field); )*
                $($(
                    if let Some(column) = &mut self.$ofield {
                        column.push(row.$ofield);
                    }
                )*)?
                let index = self.length;
                self.length += 1;
                index
            }
        }

        impl $crate::table::ColumnarTable for $name {
            const NAME: &'static str = stringify!($name);

            fn len(&self) -> usize {
                self.length
            }

            #[allow(unused_mut)]
            fn column_lengths(&self) -> Vec<(&'static str, usize)> {
                let mut lengths = vec![$( (stringify!($field), self.$field.len()), )*];
                $($(
                    if let Some(column) = &self.$ofield {
                        lengths.push((stringify!($ofield), column.len()));
                    }
                )*)?
                lengths
            }
        }
    };
}
