//! Framework detection for environment-variable inference.
//!
//! Frameworks inline environment variables with well-known prefixes into
//! build output, so those variables must contribute to the fingerprint
//! even when undeclared.

use turborepo_repository::package_graph::PackageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framework {
    slug: &'static str,
    env_wildcards: &'static [&'static str],
    dependency_match: &'static [&'static str],
}

impl Framework {
    pub fn slug(&self) -> &'static str {
        self.slug
    }

    pub fn env_wildcards(&self) -> &'static [&'static str] {
        self.env_wildcards
    }
}

const FRAMEWORKS: &[Framework] = &[
    Framework {
        slug: "nextjs",
        env_wildcards: &["NEXT_PUBLIC_*"],
        dependency_match: &["next"],
    },
    Framework {
        slug: "vite",
        env_wildcards: &["VITE_*"],
        dependency_match: &["vite"],
    },
    Framework {
        slug: "create-react-app",
        env_wildcards: &["REACT_APP_*"],
        dependency_match: &["react-scripts"],
    },
    Framework {
        slug: "gatsby",
        env_wildcards: &["GATSBY_*"],
        dependency_match: &["gatsby"],
    },
    Framework {
        slug: "astro",
        env_wildcards: &["PUBLIC_*"],
        dependency_match: &["astro"],
    },
    Framework {
        slug: "vue",
        env_wildcards: &["VUE_APP_*"],
        dependency_match: &["@vue/cli-service"],
    },
    Framework {
        slug: "sveltekit",
        env_wildcards: &["VITE_*", "PUBLIC_*"],
        dependency_match: &["@sveltejs/kit"],
    },
];

/// The framework a package builds with, judged by its declared
/// dependencies. First match wins.
pub fn infer_framework(workspace: &PackageInfo) -> Option<&'static Framework> {
    let package_json = &workspace.package_json;
    FRAMEWORKS.iter().find(|framework| {
        framework.dependency_match.iter().any(|dependency| {
            package_json.dependencies.contains_key(*dependency)
                || package_json.dev_dependencies.contains_key(*dependency)
        })
    })
}

#[cfg(test)]
mod tests {
    use turborepo_repository::package_json::PackageJson;

    use super::*;

    fn workspace_with_dep(name: &str) -> PackageInfo {
        PackageInfo {
            package_json: PackageJson {
                dependencies: [(name.to_string(), "^1.0.0".to_string())]
                    .into_iter()
                    .collect(),
                ..Default::default()
            },
            package_json_path: turbopath::AnchoredSystemPathBuf::from_raw("package.json")
                .unwrap(),
            unresolved_external_dependencies: None,
            transitive_dependencies: None,
        }
    }

    #[test]
    fn test_infers_by_dependency() {
        let next = workspace_with_dep("next");
        assert_eq!(infer_framework(&next).unwrap().slug(), "nextjs");

        let plain = workspace_with_dep("lodash");
        assert!(infer_framework(&plain).is_none());
    }
}
