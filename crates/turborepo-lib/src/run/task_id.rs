use std::{borrow::Cow, fmt};

use serde::Serialize;

pub use turborepo_repository::package_graph::ROOT_PKG_NAME;

pub const TASK_DELIMITER: &str = "#";

/// A task name as written in configuration: either a bare task (`build`)
/// or qualified with a package (`web#build`). `^`-prefixed entries in
/// `dependsOn` are handled by the engine builder, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskName<'a> {
    package: Option<Cow<'a, str>>,
    task: Cow<'a, str>,
}

/// Concrete identifier of one scheduled task: `package#task`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId<'a> {
    package: Cow<'a, str>,
    task: Cow<'a, str>,
}

impl<'a> From<&'a str> for TaskName<'a> {
    fn from(raw: &'a str) -> Self {
        match raw.split_once(TASK_DELIMITER) {
            // A leading delimiter is part of the task name, not a package
            // qualifier.
            Some(("", _)) | None => TaskName {
                package: None,
                task: raw.into(),
            },
            Some((package, task)) => TaskName {
                package: Some(package.into()),
                task: task.into(),
            },
        }
    }
}

impl From<String> for TaskName<'static> {
    fn from(raw: String) -> Self {
        TaskName::from(raw.as_str()).into_owned()
    }
}

impl<'a> fmt::Display for TaskName<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.package {
            Some(package) => write!(f, "{package}{TASK_DELIMITER}{}", self.task),
            None => f.write_str(&self.task),
        }
    }
}

impl<'a> TaskName<'a> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    pub fn is_package_task(&self) -> bool {
        self.package.is_some()
    }

    /// Whether this name can refer to the given task id: either the bare
    /// task matches, or package and task both match.
    pub fn matches(&self, task_id: &TaskId) -> bool {
        self.task == task_id.task
            && self
                .package
                .as_deref()
                .map_or(true, |package| package == task_id.package)
    }

    pub fn into_root_task(self) -> TaskName<'static> {
        TaskName {
            package: Some(Cow::Borrowed(ROOT_PKG_NAME)),
            task: Cow::Owned(self.task.into_owned()),
        }
    }

    pub fn into_owned(self) -> TaskName<'static> {
        TaskName {
            package: self.package.map(|p| Cow::Owned(p.into_owned())),
            task: Cow::Owned(self.task.into_owned()),
        }
    }

    /// The task id this name denotes, if it is fully qualified.
    pub fn task_id(&self) -> Option<TaskId<'_>> {
        Some(TaskId {
            package: Cow::Borrowed(self.package.as_deref()?),
            task: Cow::Borrowed(&self.task),
        })
    }
}

impl<'a> TaskId<'a> {
    pub fn new(package: &'a str, task: &'a str) -> Self {
        debug_assert!(!task.contains(TASK_DELIMITER));
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn from_static(package: String, task: String) -> TaskId<'static> {
        TaskId {
            package: package.into(),
            task: task.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn as_task_name(&self) -> TaskName<'_> {
        TaskName {
            package: Some(Cow::Borrowed(&self.package)),
            task: Cow::Borrowed(&self.task),
        }
    }

    pub fn into_owned(self) -> TaskId<'static> {
        TaskId {
            package: Cow::Owned(self.package.into_owned()),
            task: Cow::Owned(self.task.into_owned()),
        }
    }
}

impl<'a> fmt::Display for TaskId<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{TASK_DELIMITER}{}", self.package, self.task)
    }
}

impl<'a> Serialize for TaskId<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Serialize for TaskName<'a> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("build", None, "build" ; "bare task")]
    #[test_case("web#build", Some("web"), "build" ; "qualified task")]
    #[test_case("//#build", Some("//"), "build" ; "root task")]
    #[test_case("#build", None, "#build" ; "leading delimiter is not a package")]
    fn test_task_name_parsing(raw: &str, package: Option<&str>, task: &str) {
        let name = TaskName::from(raw);
        assert_eq!(name.package(), package);
        assert_eq!(name.task(), task);
    }

    #[test]
    fn test_matching() {
        let build = TaskName::from("build");
        let web_build = TaskName::from("web#build");
        let id = TaskId::new("web", "build");

        assert!(build.matches(&id));
        assert!(web_build.matches(&id));
        assert!(!TaskName::from("docs#build").matches(&id));
        assert!(!TaskName::from("test").matches(&id));
    }

    #[test]
    fn test_into_root_task() {
        let name = TaskName::from("build").into_root_task();
        assert_eq!(name.to_string(), "//#build");
        assert_eq!(
            name.task_id(),
            Some(TaskId::new(ROOT_PKG_NAME, "build"))
        );
    }
}
