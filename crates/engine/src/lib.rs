pub mod cell;
pub mod cell_id;
pub mod conditional;
pub mod dep_graph;
pub mod drawing;
pub mod error;
pub mod formula;
pub mod layout;
pub mod named_range;
pub mod number_format;
pub mod protection;
pub mod recalc;
pub mod sheet;
pub mod structure;
pub mod style;
pub mod table;
pub mod workbook;

pub use cell::{Cell, CellValue, Comment, Formula};
pub use cell_id::CellId;
pub use error::{EngineError, Result};
pub use formula::value::{CellError, Value};
pub use named_range::{NameScope, NamedRange};
pub use recalc::{EvalState, RecalcReport};
pub use sheet::{Sheet, SheetId};
pub use structure::SortOrder;
pub use style::{Style, StyleId, StylePool};
pub use table::{DataTable, NamedTable, TableValue};
pub use workbook::{Metadata, Workbook};
