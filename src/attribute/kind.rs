//! Attribute classification by declared JMX type

/// Shape of an attribute value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// One scalar
    Simple,
    /// One flat level of named values
    Composite,
    /// Index-keyed rows
    Tabular,
    /// Named groups of statistics
    SubCollection,
}

const SIMPLE_TYPES: &[&str] = &[
    "long",
    "int",
    "short",
    "byte",
    "float",
    "double",
    "boolean",
    "java.lang.Long",
    "java.lang.Integer",
    "java.lang.Short",
    "java.lang.Byte",
    "java.lang.Float",
    "java.lang.Double",
    "java.lang.Boolean",
    "java.lang.Number",
    "java.lang.String",
    "java.lang.Object",
    "java.util.concurrent.atomic.AtomicInteger",
    "java.util.concurrent.atomic.AtomicLong",
];

const COMPOSITE_TYPES: &[&str] = &[
    "javax.management.openmbean.CompositeData",
    "javax.management.openmbean.CompositeDataSupport",
    "java.util.HashMap",
    "java.util.Map",
];

const TABULAR_TYPES: &[&str] = &[
    "javax.management.openmbean.TabularData",
    "javax.management.openmbean.TabularDataSupport",
];

/// Static classification; `None` means the type can only be recognised from
/// its live value (statistics objects) or is unsupported
pub fn classify_type(type_name: &str) -> Option<AttributeKind> {
    if SIMPLE_TYPES.contains(&type_name) {
        Some(AttributeKind::Simple)
    } else if COMPOSITE_TYPES.contains(&type_name) {
        Some(AttributeKind::Composite)
    } else if TABULAR_TYPES.contains(&type_name) {
        Some(AttributeKind::Tabular)
    } else {
        None
    }
}
