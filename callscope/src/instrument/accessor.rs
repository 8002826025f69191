//! Method shape and the accessor predicate
//!
//! Rules can skip trivial property accessors, which mostly read or write a
//! field and would otherwise dominate hit counts.

use std::fmt;
use std::str::FromStr;

/// Visibility of a method, ordered from most to least restrictive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Access {
    Private,
    Package,
    Protected,
    Public,
}

impl FromStr for Access {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "private" => Ok(Access::Private),
            "package" => Ok(Access::Package),
            "protected" => Ok(Access::Protected),
            "public" => Ok(Access::Public),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Access::Private => "private",
            Access::Package => "package",
            Access::Protected => "protected",
            Access::Public => "public",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Modifiers {
    pub access: Access,
    /// Associated function without a receiver
    pub is_static: bool,
}

impl Modifiers {
    pub const PUBLIC: Modifiers = Modifiers { access: Access::Public, is_static: false };
}

/// Name, parameter types and return type of a method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    pub params: Vec<String>,
    /// `None` for methods returning unit
    pub returns: Option<String>,
}

impl MethodSignature {
    #[must_use]
    pub fn new(name: impl Into<String>, params: &[&str], returns: Option<&str>) -> Self {
        Self {
            name: name.into(),
            params: params.iter().map(|p| (*p).to_string()).collect(),
            returns: returns.map(str::to_string),
        }
    }

    /// `name(p1, p2)`, the method part of a qualified name
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{}({})", self.name, self.params.join(", "))
    }
}

/// Strip a `get`/`set`/`is` prefix when it introduces a property name
/// (`getName`, `get_name`).
fn property_suffix<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = name.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('_').unwrap_or(rest);
    let first = rest.chars().next()?;
    (first.is_alphabetic() || first == '_').then_some(rest)
}

fn is_bool(ty: &str) -> bool {
    matches!(ty, "bool" | "boolean")
}

/// Whether a method looks like a plain property accessor.
///
/// Accessors are public instance methods shaped as:
/// - `getX()` returning a value
/// - `isX()` returning a boolean
/// - `setX(v)` returning nothing
#[must_use]
pub fn is_accessor_like(signature: &MethodSignature, modifiers: Modifiers) -> bool {
    if modifiers.access != Access::Public || modifiers.is_static {
        return false;
    }
    let name = signature.name.as_str();
    let returns = signature.returns.as_deref();

    match signature.params.len() {
        0 => {
            (property_suffix(name, "get").is_some() && returns.is_some())
                || (property_suffix(name, "is").is_some() && returns.is_some_and(is_bool))
        }
        1 => property_suffix(name, "set").is_some() && returns.is_none(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getters_and_setters_are_accessors() {
        let getter = MethodSignature::new("get_name", &[], Some("String"));
        let camel = MethodSignature::new("getName", &[], Some("String"));
        let flag = MethodSignature::new("is_ready", &[], Some("bool"));
        let setter = MethodSignature::new("set_name", &["String"], None);
        for sig in [getter, camel, flag, setter] {
            assert!(is_accessor_like(&sig, Modifiers::PUBLIC), "{sig:?}");
        }
    }

    #[test]
    fn test_non_accessors() {
        let cases = [
            MethodSignature::new("get", &[], Some("u32")),
            MethodSignature::new("getaway", &["u8"], Some("u32")),
            MethodSignature::new("is_ready", &[], Some("u32")),
            MethodSignature::new("set_name", &["String"], Some("bool")),
            MethodSignature::new("get_name", &[], None),
            MethodSignature::new("settle", &[], None),
        ];
        for sig in cases {
            assert!(!is_accessor_like(&sig, Modifiers::PUBLIC), "{sig:?}");
        }
    }

    #[test]
    fn test_static_or_private_methods_are_never_accessors() {
        let getter = MethodSignature::new("get_name", &[], Some("String"));
        assert!(!is_accessor_like(&getter, Modifiers { access: Access::Public, is_static: true }));
        assert!(!is_accessor_like(&getter, Modifiers { access: Access::Private, is_static: false }));
    }

    #[test]
    fn test_access_order() {
        assert!(Access::Private < Access::Package);
        assert!(Access::Protected < Access::Public);
        assert_eq!("Protected".parse::<Access>(), Ok(Access::Protected));
    }

    #[test]
    fn test_display_name() {
        let sig = MethodSignature::new("query", &["&str", "u32"], Some("Rows"));
        assert_eq!(sig.display_name(), "query(&str, u32)");
    }
}
