//! Cheaply clonable interned-style strings.
//!
//! Identifiers in the broker (plan-type keys, provider tags, region names)
//! are copied onto every plan, instance, and log line. `ArcStr` makes those
//! clones a refcount bump.

pub use arcstr::{ArcStr, format, literal};

pub type Strng = ArcStr;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_and_new_compare_equal() {
		const K: Strng = literal!("vendor-a_usa_residential");
		assert_eq!(K, new(String::from("vendor-a_usa_residential")));
	}
}
