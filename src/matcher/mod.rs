pub mod modify;
pub mod projection;
pub mod selector;
pub mod values;

pub use modify::{ModifyError, can_be_directly_applied, is_modifier, make_changed_fields, modify};
pub use projection::{Projection, check_supported_projection, combine_into_projection};
pub use selector::Matcher;
pub use values::{bson_cmp, values_equal};
