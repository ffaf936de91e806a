use anyhow::{bail, Result};
use rigger_registry::{
    control::cancel::is_canceled, Diff, DiffType, LoadOptions, Registry, RegistryOptions,
};
use tokio_util::sync::CancellationToken;

use crate::{deployment::Deployment, interrupt, local, options::Options, state::StateFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Only show what would change.
    Plan,
    Apply,
    /// Remove every resource in the state.
    Destroy,
}

pub(crate) fn run(options: &Options, mode: Mode) -> Result<()> {
    let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match runtime.block_on(run_cycle(options, mode, interrupt_state.token())) {
        Ok(_) => Ok(()),
        Err(e) if is_canceled(&e) || interrupt_state.is_interrupted() => {
            tracing::debug!("{:#}", e);
            bail!("interrupted")
        }
        Err(e) => Err(e),
    }
}

fn describe(diff: &Diff) -> String {
    if diff.changed_fields.is_empty() {
        format!("{:>8} {}", diff.type_, diff.object)
    } else {
        format!(
            "{:>8} {} ({})",
            diff.type_,
            diff.object,
            diff.changed_fields.join(", ")
        )
    }
}

/// Load, diff and, unless planning, apply. The state is saved after
/// applying, whether or not all operations succeeded.
pub(crate) async fn run_cycle(
    options: &Options,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<Vec<Diff>> {
    let deployment = Deployment::read(&options.deployment)?;
    let mut state_file = StateFile::open(&options.state)?;
    let state = state_file.lock()?;

    let mut registry = Registry::new(RegistryOptions {
        concurrency: usize::from(options.concurrency),
    });
    local::register_types(&mut registry);
    deployment.declare(&mut registry)?;

    let load_options = LoadOptions {
        read: !options.no_read,
    };
    registry
        .load(&state.read()?, &(), &load_options, cancel)
        .await?;

    let diffs: Vec<Diff> = registry
        .diff(mode == Mode::Destroy, cancel)
        .await?
        .into_iter()
        .filter(|d| d.type_ != DiffType::None)
        .collect();
    if diffs.is_empty() {
        println!("No changes.");
    }
    for diff in &diffs {
        println!("{}", describe(diff));
    }
    if mode == Mode::Plan {
        return Ok(diffs);
    }

    let r = registry
        .apply(&(), &diffs, cancel, |action| {
            tracing::info!(
                "{} {} {}/{}",
                action.type_,
                action.object_name,
                action.progress,
                action.total
            );
        })
        .await;
    state.save(&registry.dump()?)?;
    r?;
    Ok(diffs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::path::Path;

    fn options(dir: &Path) -> Options {
        Options {
            verbose: false,
            color: clap::ColorChoice::Never,
            state: dir.join("state.json"),
            deployment: dir.join("rigger.json"),
            concurrency: 5,
            no_read: false,
        }
    }

    fn write_deployment(dir: &Path, doc: Value) {
        std::fs::write(dir.join("rigger.json"), serde_json::to_vec(&doc).unwrap()).unwrap();
    }

    fn summary(diffs: &[Diff]) -> Vec<(DiffType, String, Vec<String>)> {
        diffs
            .iter()
            .map(|d| (d.type_, d.object.id.clone(), d.changed_fields.clone()))
            .collect()
    }

    fn deployment(file: &Path) -> Value {
        json!({"resources": [
            {"id": "pw", "type": "random_string", "inputs": {"length": 8}},
            {"id": "conf", "type": "file", "inputs": {
                "path": file.to_str().unwrap(),
                "contents": {"$format": ["password={}\n", {"$ref": "pw.value"}]}}},
        ]})
    }

    async fn cycle(options: &Options, mode: Mode) -> Vec<Diff> {
        run_cycle(options, mode, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_then_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.conf");
        let options = options(dir.path());
        write_deployment(dir.path(), deployment(&file));

        let planned = cycle(&options, Mode::Plan).await;
        assert_eq!(
            summary(&planned),
            vec![
                (
                    DiffType::Create,
                    "conf".to_owned(),
                    vec!["contents".to_owned(), "path".to_owned()]
                ),
                (
                    DiffType::Create,
                    "pw".to_owned(),
                    vec!["length".to_owned(), "value".to_owned()]
                ),
            ]
        );
        assert!(!options.state.exists());

        cycle(&options, Mode::Apply).await;
        let contents = std::fs::read_to_string(&file).unwrap();
        let password = contents
            .strip_prefix("password=")
            .unwrap()
            .trim_end()
            .to_owned();
        assert_eq!(password.len(), 8);

        assert!(cycle(&options, Mode::Plan).await.is_empty());
        assert!(cycle(&options, Mode::Apply).await.is_empty());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), contents);

        let state: Value =
            serde_json::from_slice(&std::fs::read(&options.state).unwrap()).unwrap();
        let pw = state
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["id"] == "pw")
            .unwrap();
        assert_eq!(pw["properties"]["value"], json!(password));
        assert_eq!(pw["depended_by"][0]["id"], "conf");
    }

    #[tokio::test]
    async fn test_drift_is_repaired() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.conf");
        let options = options(dir.path());
        write_deployment(dir.path(), deployment(&file));
        cycle(&options, Mode::Apply).await;
        let contents = std::fs::read_to_string(&file).unwrap();

        std::fs::write(&file, "tampered").unwrap();
        let diffs = cycle(&options, Mode::Apply).await;
        assert_eq!(
            summary(&diffs),
            vec![(
                DiffType::Update,
                "conf".to_owned(),
                vec!["contents".to_owned()]
            )]
        );
        assert_eq!(std::fs::read_to_string(&file).unwrap(), contents);

        // without reading, the state is trusted
        std::fs::write(&file, "tampered").unwrap();
        let trusting = Options {
            no_read: true,
            ..options.clone()
        };
        assert!(cycle(&trusting, Mode::Plan).await.is_empty());
    }

    #[tokio::test]
    async fn test_path_change_recreates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.conf");
        let new = dir.path().join("new.conf");
        let options = options(dir.path());
        let doc = |path: &Path| {
            json!({"resources": [
                {"id": "conf", "type": "file", "inputs": {
                    "path": path.to_str().unwrap(), "contents": "x"}},
            ]})
        };
        write_deployment(dir.path(), doc(&old));
        cycle(&options, Mode::Apply).await;

        write_deployment(dir.path(), doc(&new));
        let diffs = cycle(&options, Mode::Apply).await;
        assert_eq!(
            summary(&diffs),
            vec![(DiffType::Recreate, "conf".to_owned(), vec!["path".to_owned()])]
        );
        assert!(!old.exists());
        assert_eq!(std::fs::read_to_string(&new).unwrap(), "x");
        assert!(cycle(&options, Mode::Plan).await.is_empty());
    }

    #[tokio::test]
    async fn test_renamed_resource_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.conf");
        let options = options(dir.path());
        write_deployment(
            dir.path(),
            json!({"resources": [
                {"id": "old", "type": "file", "inputs": {
                    "path": file.to_str().unwrap(), "contents": "x"}},
            ]}),
        );
        cycle(&options, Mode::Apply).await;

        write_deployment(
            dir.path(),
            json!({"resources": [
                {"id": "new", "type": "file", "inputs": {
                    "path": file.to_str().unwrap(), "contents": "x"}},
            ]}),
        );
        assert!(cycle(&options, Mode::Apply).await.is_empty());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "x");
        let state: Value =
            serde_json::from_slice(&std::fs::read(&options.state).unwrap()).unwrap();
        let ids: Vec<&Value> = state.as_array().unwrap().iter().map(|r| &r["id"]).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test]
    async fn test_undeclared_and_destroyed_resources_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let options = options(dir.path());
        write_deployment(
            dir.path(),
            json!({"resources": [
                {"id": "a", "type": "file", "inputs": {"path": a.to_str().unwrap()}},
                {"id": "b", "type": "file", "inputs": {
                    "path": b.to_str().unwrap(), "contents": {"$ref": "a.contents"}}},
            ]}),
        );
        cycle(&options, Mode::Apply).await;
        assert!(a.exists() && b.exists());

        write_deployment(
            dir.path(),
            json!({"resources": [
                {"id": "a", "type": "file", "inputs": {"path": a.to_str().unwrap()}},
            ]}),
        );
        let diffs = cycle(&options, Mode::Apply).await;
        assert_eq!(summary(&diffs), vec![(DiffType::Delete, "b".to_owned(), vec![])]);
        assert!(a.exists() && !b.exists());

        let diffs = cycle(&options, Mode::Destroy).await;
        assert_eq!(summary(&diffs), vec![(DiffType::Delete, "a".to_owned(), vec![])]);
        assert!(!a.exists());
        assert_eq!(std::fs::read(&options.state).unwrap(), b"[]");
    }

    #[tokio::test]
    async fn test_failure_still_saves_state() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        let options = options(dir.path());
        write_deployment(
            dir.path(),
            json!({"resources": [
                {"id": "good", "type": "file", "inputs": {"path": good.to_str().unwrap()}},
                {"id": "bad", "type": "file", "inputs": {
                    "path": dir.path().join("missing/dir/file").to_str().unwrap()}},
            ]}),
        );
        let err = run_cycle(&options, Mode::Apply, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Could not write file"));

        let state: Value =
            serde_json::from_slice(&std::fs::read(&options.state).unwrap()).unwrap();
        let ids: Vec<&Value> = state.as_array().unwrap().iter().map(|r| &r["id"]).collect();
        assert!(!ids.contains(&&json!("bad")));
    }

    #[test]
    fn test_describe() {
        let d = Diff::new(
            rigger_registry::ResourceId::new("", "file", "conf"),
            DiffType::Update,
            vec!["contents".to_owned()],
        );
        assert_eq!(describe(&d), "  update file/conf (contents)");
        let d = Diff::new(
            rigger_registry::ResourceId::new("infra", "file", "x"),
            DiffType::Delete,
            vec![],
        );
        assert_eq!(describe(&d), "  delete infra/file/x");
    }
}
