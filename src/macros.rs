//! Declarative helpers shared across the crate.

/// Declares one `pub const NAME: i64` per entry together with a
/// `get_error_message` lookup built from the same table.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(
            #[doc = $msg]
            pub const $name: i64 = $code;
        )*

        /// Returns the human readable text for a known error code.
        pub fn get_error_message(code: i64) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown error",
            }
        }
    };
}
