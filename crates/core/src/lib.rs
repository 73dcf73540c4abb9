// Core address and range types shared by the engine and file formats

pub mod address;
pub mod error;
pub mod range;

pub use address::{col_to_letters, letters_to_col, CellAddr, MAX_COLS, MAX_ROWS};
pub use error::{AddressError, Result};
pub use range::{format_sheet_name, CellRange, MultiRange};
