//! Representative listing texts for demos and benchmarks.

/// Property descriptions spanning both labels.
pub const SAMPLE_LISTINGS: &[&str] = &[
    "No kids under 12 allowed",
    "Great school district nearby",
    "Perfect for young professionals",
    "Wheelchair accessible entrance",
    "Christian community preferred",
    "Walking distance to shops and restaurants",
    "Ideal for active adults",
    "Family-friendly neighborhood with parks",
    "No section 8",
    "Spacious 2BR apartment with modern amenities",
];
