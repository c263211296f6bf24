//! Decides which units get rewritten.
//!
//! Rules are literal string prefixes over internal (`/`-separated) unit
//! names. The test is not segment-aware: the rule `com/app` also matches
//! `com/application/Main`.

/// The profiler's own units. Probing these would recurse into the counter.
const SELF_PREFIXES: &[&str] = &["hotpath/CounterStore", "hotpath/Report", "hotpath/Agent"];

/// Runtime, standard library and infrastructure packages that are unsafe or
/// pointless to rewrite.
const RUNTIME_PREFIXES: &[&str] = &[
    "java/",
    "javax/",
    "sun/",
    "jdk/",
    "com/sun/",
    "io/micronaut/",
    "jakarta/",
    "org/slf4j/",
    "ch/qos/logback/",
    "io/netty/",
];

/// Markers dependency-injection frameworks put in generated unit names.
const SYNTHETIC_MARKERS: &[&str] = &[
    "$Definition",
    "$Introspection",
    "$Intercepted",
    "$Proxy",
    "$$",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Instrument,
    SelfUnit,
    Runtime,
    Synthetic,
    Excluded,
    NotIncluded,
}

impl Decision {
    pub fn is_instrument(self) -> bool {
        self == Decision::Instrument
    }

    pub fn reason(self) -> &'static str {
        match self {
            Decision::Instrument => "included",
            Decision::SelfUnit => "profiler unit",
            Decision::Runtime => "runtime package",
            Decision::Synthetic => "generated unit",
            Decision::Excluded => "exclude rule",
            Decision::NotIncluded => "no include rule matched",
        }
    }
}

/// Evaluate the rules in precedence order; the first rule that fires wins.
pub fn decide<S: AsRef<str>>(unit: &str, include: &[S], exclude: &[S]) -> Decision {
    if SELF_PREFIXES.iter().any(|p| unit.starts_with(p)) {
        return Decision::SelfUnit;
    }
    if RUNTIME_PREFIXES.iter().any(|p| unit.starts_with(p)) {
        return Decision::Runtime;
    }
    if SYNTHETIC_MARKERS.iter().any(|m| unit.contains(m)) {
        return Decision::Synthetic;
    }
    if exclude.iter().any(|p| unit.starts_with(p.as_ref())) {
        return Decision::Excluded;
    }
    if !include.is_empty() && !include.iter().any(|p| unit.starts_with(p.as_ref())) {
        return Decision::NotIncluded;
    }
    Decision::Instrument
}

pub fn should_instrument<S: AsRef<str>>(unit: &str, include: &[S], exclude: &[S]) -> bool {
    decide(unit, include, exclude).is_instrument()
}

/// Configured include/exclude prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InclusionFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl InclusionFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        InclusionFilter { include, exclude }
    }

    pub fn decide(&self, unit: &str) -> Decision {
        decide(unit, &self.include, &self.exclude)
    }

    pub fn should_instrument(&self, unit: &str) -> bool {
        self.decide(unit).is_instrument()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const NONE: &[&str] = &[];

    #[test]
    fn test_self_units_beat_include_rules() {
        let include = ["hotpath/"];
        assert_eq!(
            decide("hotpath/CounterStore", &include, NONE),
            Decision::SelfUnit
        );
        assert_eq!(
            decide("hotpath/ReportGenerator", &include, NONE),
            Decision::SelfUnit
        );
        assert!(should_instrument("hotpath/demo/Main", &include, NONE));
    }

    #[test]
    fn test_runtime_packages_are_skipped() {
        for unit in [
            "java/lang/String",
            "jdk/internal/Foo",
            "io/micronaut/Context",
            "org/slf4j/Logger",
            "com/sun/proxy/Thing",
        ] {
            assert_eq!(decide(unit, NONE, NONE), Decision::Runtime, "{unit}");
        }
    }

    #[test]
    fn test_generated_units_are_skipped() {
        for unit in [
            "com/app/$Service$Definition",
            "com/app/Service$Intercepted",
            "com/app/Service$Introspection",
            "com/app/Service$$EnhancerByCglib",
        ] {
            assert_eq!(decide(unit, NONE, NONE), Decision::Synthetic, "{unit}");
        }
        assert!(should_instrument("com/app/Service$Inner", NONE, NONE));
    }

    #[test]
    fn test_exclude_beats_include() {
        let include = ["com/app"];
        let exclude = ["com/app/ignored"];
        assert_eq!(
            decide("com/app/ignored/Secret", &include, &exclude),
            Decision::Excluded
        );
        assert!(should_instrument("com/app/Logic", &include, &exclude));
    }

    #[test]
    fn test_include_rules_only_restrict_when_present() {
        assert_eq!(
            decide("org/other/App", &["com/app"], NONE),
            Decision::NotIncluded
        );
        assert!(should_instrument("org/other/App", NONE, NONE));
    }

    #[test]
    fn test_prefix_match_is_not_segment_aware() {
        assert!(should_instrument("a/bc/Thing", &["a/b"], NONE));
        assert_eq!(decide("a/bc/Thing", NONE, &["a/b"]), Decision::Excluded);
    }

    proptest! {
        #[test]
        fn prop_excluded_units_never_instrumented(
            pkg in "[a-z]{1,6}",
            rest in "[A-Za-z]{1,8}",
        ) {
            let unit = format!("{pkg}/{rest}");
            let rules = vec![pkg.clone()];
            prop_assert!(!should_instrument(&unit, &rules, &rules));
            prop_assert!(should_instrument(&unit, &rules, &[]));
        }
    }
}
