/// Cache-hit prediction never changes local or remote state.
mod common;

#[cfg(test)]
mod tests {
    use super::common::{self, FakeRegistry, FakeRuntime};
    use imageforge::ForgeConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_predicts_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let runtime = Arc::new(common::alpine_runtime());
        let forge = common::forge(common::config(dir.path()), runtime.clone());

        assert!(!forge.predict_cache_hit(&root).await.unwrap());
        assert!(runtime.calls().is_empty());

        forge.build(&root).await.unwrap();
        let after_build = runtime.calls().len();

        assert!(forge.predict_cache_hit(&root).await.unwrap());
        assert_eq!(runtime.calls().len(), after_build);
    }

    #[tokio::test]
    async fn test_dependency_change_predicts_miss() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let runtime = Arc::new(common::alpine_runtime());
        let forge = common::forge(common::config(dir.path()), runtime.clone());
        forge.build(&root).await.unwrap();

        common::write(dir.path(), "c/app.txt", "c sources, edited\n");

        assert!(!forge.predict_cache_hit(&root).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_base_predicts_miss_without_pulling() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let runtime = Arc::new(FakeRuntime::new());
        let forge = common::forge(common::config(dir.path()), runtime.clone());

        assert!(!forge.predict_cache_hit(&root).await.unwrap());
        assert!(runtime.pulls().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_predicts_miss() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let runtime = Arc::new(common::alpine_runtime());
        common::forge(common::config(dir.path()), runtime.clone())
            .build(&root)
            .await
            .unwrap();

        let config = ForgeConfig {
            rebuild: true,
            ..common::config(dir.path())
        };
        let forge = common::forge(config, runtime.clone());

        assert!(!forge.predict_cache_hit(&root).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_caching_predicts_miss() {
        let dir = TempDir::new().unwrap();
        let root = common::spec_dir(
            dir.path(),
            "tool",
            "name: tool\nfroms: [\"alpine:3.20\"]\nsrcs: [app.txt]\ndisable_caching: true\n",
        );
        let runtime = Arc::new(common::alpine_runtime());
        let forge = common::forge(common::config(dir.path()), runtime.clone());
        forge.build(&root).await.unwrap();

        assert!(!forge.predict_cache_hit(&root).await.unwrap());
    }

    #[tokio::test]
    async fn test_predicts_remote_hit_without_pulling() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let registry = Arc::new(FakeRegistry::new());
        let config = ForgeConfig {
            remote_cache: true,
            ..common::config(dir.path())
        };
        common::forge(
            config.clone(),
            Arc::new(common::alpine_runtime().with_registry(registry.clone())),
        )
        .with_registry(registry.clone())
        .build(&root)
        .await
        .unwrap();

        let fresh = Arc::new(common::alpine_runtime().with_registry(registry.clone()));
        let forge = common::forge(config, fresh.clone()).with_registry(registry.clone());

        assert!(forge.predict_cache_hit(&root).await.unwrap());
        assert!(fresh.calls().is_empty());
        assert!(registry.puts().is_empty());
    }

    #[tokio::test]
    async fn test_predict_matches_build_outcome() {
        let dir = TempDir::new().unwrap();
        let root = common::chain(dir.path());
        let runtime = Arc::new(common::alpine_runtime());
        let forge = common::forge(common::config(dir.path()), runtime.clone());

        for edit in ["one", "two", "two"] {
            common::write(dir.path(), "a/app.txt", edit);
            let predicted = forge.predict_cache_hit(&root).await.unwrap();
            let report = forge.build(&root).await.unwrap();
            let built = report.root_report().unwrap().outcome == imageforge::SpecOutcome::Built;
            assert_eq!(predicted, !built, "prediction wrong for edit {}", edit);
        }
    }
}
