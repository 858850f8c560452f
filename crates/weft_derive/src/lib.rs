use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod unit;

/// Implements `Unit` by forwarding to the field marked `#[unit]` (or the single field of a
/// tuple struct), which must be a `UnitBase`.
#[proc_macro_derive(Unit, attributes(unit))]
pub fn derive_unit(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = unit::derive_unit(input);
    expanded.into()
}
