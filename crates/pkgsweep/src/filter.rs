use std::fmt;

use crate::config::BatchConfig;
use crate::package::PackageListing;
use crate::progress::ProgressState;

/// Why a package was left out of analysis without touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The package name is on the configured exclude list.
    Excluded,
    /// The selected release has been retired by its owners.
    Retired,
    /// The package declares none of the build tools that mark analyzable source.
    MissingBuildTool {
        required: Vec<String>,
        found: Vec<String>,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excluded => write!(f, "excluded by configuration"),
            Self::Retired => write!(f, "retired"),
            Self::MissingBuildTool { required, found } if found.is_empty() => {
                write!(f, "no build tools declared (need one of {})", required.join(", "))
            }
            Self::MissingBuildTool { required, found } => write!(
                f,
                "built with {} (need one of {})",
                found.join(", "),
                required.join(", ")
            ),
        }
    }
}

/// What to do with one catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Keep,
    SkipAlreadyDone,
    SkipCriteria(SkipReason),
}

/// Decide whether a listing should be processed.
///
/// Pure: looks only at the listing, the ledger and the configuration.
pub fn decide(listing: &PackageListing, state: &ProgressState, config: &BatchConfig) -> Decision {
    if !config.force
        && state
            .get(&listing.package)
            .is_some_and(|entry| entry.is_terminal(config.max_attempts))
    {
        return Decision::SkipAlreadyDone;
    }

    let name = listing.package.name();
    if config.exclude.iter().any(|excluded| excluded == name) {
        return Decision::SkipCriteria(SkipReason::Excluded);
    }

    if config.skip_retired && listing.retired {
        return Decision::SkipCriteria(SkipReason::Retired);
    }

    if !config.required_build_tools.is_empty()
        && !listing.build_tools.iter().any(|tool| {
            config
                .required_build_tools
                .iter()
                .any(|required| required.eq_ignore_ascii_case(tool))
        })
    {
        return Decision::SkipCriteria(SkipReason::MissingBuildTool {
            required: config.required_build_tools.clone(),
            found: listing.build_tools.clone(),
        });
    }

    Decision::Keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{FailureKind, FailureRecord};
    use crate::package::PackageRef;
    use crate::progress::{Cursor, ItemOutcome};

    fn listing(name: &str) -> PackageListing {
        PackageListing::new(PackageRef::new(name, "0.1.0"), format!("https://repo/{name}.tar"))
            .with_build_tools(["mix"])
    }

    fn config() -> crate::config::BatchConfigBuilder {
        BatchConfig::builder("/out").temp_root("/tmp/work")
    }

    fn failed(state: &mut ProgressState, name: &str, retryable: bool, attempt: u32) {
        let package = PackageRef::new(name, "0.1.0");
        state.record(
            &package,
            Cursor { page: 1, index: 0 },
            &ItemOutcome::Failed(FailureRecord {
                package: package.clone(),
                kind: FailureKind::DownloadError,
                retryable,
                message: "x".into(),
                attempt,
            }),
            1,
        );
    }

    #[test]
    fn keeps_unknown_packages() {
        let state = ProgressState::new(0);
        assert_eq!(decide(&listing("plug"), &state, &config().build().unwrap()), Decision::Keep);
    }

    #[test]
    fn skips_succeeded_and_permanent_failures() {
        let mut state = ProgressState::new(0);
        let done = PackageRef::new("done", "0.1.0");
        state.record(
            &done,
            Cursor { page: 1, index: 0 },
            &ItemOutcome::Succeeded { output: "/out/done".into() },
            1,
        );
        failed(&mut state, "broken", false, 1);
        let config = config().build().unwrap();

        assert_eq!(decide(&listing("done"), &state, &config), Decision::SkipAlreadyDone);
        assert_eq!(decide(&listing("broken"), &state, &config), Decision::SkipAlreadyDone);
    }

    #[test]
    fn retryable_failures_are_retried_until_attempts_run_out() {
        let mut state = ProgressState::new(0);
        failed(&mut state, "flaky", true, 1);
        failed(&mut state, "exhausted", true, 3);
        let config = config().max_attempts(3).build().unwrap();

        assert_eq!(decide(&listing("flaky"), &state, &config), Decision::Keep);
        assert_eq!(decide(&listing("exhausted"), &state, &config), Decision::SkipAlreadyDone);
    }

    #[test]
    fn force_ignores_the_ledger() {
        let mut state = ProgressState::new(0);
        failed(&mut state, "broken", false, 1);
        let config = config().force(true).build().unwrap();
        assert_eq!(decide(&listing("broken"), &state, &config), Decision::Keep);
    }

    #[test]
    fn criteria_rejections() {
        let state = ProgressState::new(0);
        let config = config()
            .exclude(["secret"])
            .skip_retired(true)
            .required_build_tools(["mix", "rebar3"])
            .build()
            .unwrap();

        assert_eq!(
            decide(&listing("secret"), &state, &config),
            Decision::SkipCriteria(SkipReason::Excluded)
        );
        assert_eq!(
            decide(&listing("old").retired(true), &state, &config),
            Decision::SkipCriteria(SkipReason::Retired)
        );

        let erlang_make = listing("nif").with_build_tools(["make"]);
        match decide(&erlang_make, &state, &config) {
            Decision::SkipCriteria(SkipReason::MissingBuildTool { found, .. }) => {
                assert_eq!(found, vec!["make".to_owned()]);
            }
            other => panic!("expected MissingBuildTool, got {other:?}"),
        }

        let rebar = listing("cowboy").with_build_tools(["Rebar3"]);
        assert_eq!(decide(&rebar, &state, &config), Decision::Keep);
    }

    #[test]
    fn skip_reason_display() {
        let reason = SkipReason::MissingBuildTool {
            required: vec!["mix".into()],
            found: vec![],
        };
        assert_eq!(reason.to_string(), "no build tools declared (need one of mix)");
    }
}
