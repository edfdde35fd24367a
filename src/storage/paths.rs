// src/storage/paths.rs

use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, AppResult};

/// 词法归一化：消去 `.` 与 `..`，不要求路径存在
fn normalize(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

fn reject_suspicious(raw: &str) -> AppResult<()> {
    if raw.is_empty() {
        return Err(AppError::PathInvalid("path is empty".to_string()));
    }
    if raw.chars().any(|c| c.is_control()) {
        return Err(AppError::PathInvalid("path contains control characters".to_string()));
    }
    // 归一化之前就拒绝 `..`，符号链接留给 canonicalize 处理
    if Path::new(raw).components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::PathForbidden(raw.to_string()));
    }
    Ok(())
}

async fn within_roots(candidate: &Path, roots: &[PathBuf]) -> bool {
    for root in roots {
        let root = match tokio::fs::canonicalize(root).await {
            Ok(r) => r,
            Err(_) => continue,
        };
        if candidate.starts_with(&root) {
            return true;
        }
    }
    false
}

/// 校验下载/读取路径：必须存在、可解析且位于白名单根目录内
pub async fn resolve_existing_path(raw: &str, roots: &[PathBuf]) -> AppResult<PathBuf> {
    reject_suspicious(raw)?;

    let resolved = tokio::fs::canonicalize(normalize(Path::new(raw)))
        .await
        .map_err(|_| AppError::NotFound(format!("path does not exist: {}", raw)))?;

    if !within_roots(&resolved, roots).await {
        return Err(AppError::PathForbidden(raw.to_string()));
    }
    Ok(resolved)
}

/// 校验上传目标路径：父目录必须存在且为目录，结果位于白名单内。
/// 目标文件本身允许不存在。
pub async fn resolve_target_path(raw: &str, roots: &[PathBuf]) -> AppResult<PathBuf> {
    reject_suspicious(raw)?;

    let normalized = normalize(Path::new(raw));
    let file_name = normalized
        .file_name()
        .ok_or_else(|| AppError::PathInvalid(format!("path has no file name: {}", raw)))?
        .to_owned();
    let parent = normalized
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| AppError::PathInvalid(format!("path has no parent directory: {}", raw)))?;

    let canonical_parent = tokio::fs::canonicalize(parent)
        .await
        .map_err(|_| AppError::PathInvalid(format!("destination does not exist: {}", parent.display())))?;

    let meta = tokio::fs::metadata(&canonical_parent).await?;
    if !meta.is_dir() {
        return Err(AppError::ConflictExists(format!(
            "destination is not a directory: {}",
            parent.display()
        )));
    }

    let resolved = canonical_parent.join(file_name);
    if !within_roots(&resolved, roots).await {
        return Err(AppError::PathForbidden(raw.to_string()));
    }

    // 目标已存在且是目录时无法写文件
    if let Ok(existing) = tokio::fs::metadata(&resolved).await {
        if existing.is_dir() {
            return Err(AppError::ConflictExists(format!(
                "target is a directory: {}",
                resolved.display()
            )));
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_traversal_is_forbidden() {
        let dir = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let raw = format!("{}/../etc/passwd", dir.path().display());
        let err = resolve_existing_path(&raw, &roots).await.unwrap_err();
        assert!(matches!(err, AppError::PathForbidden(_)));
    }

    #[tokio::test]
    async fn test_outside_roots_is_forbidden() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let outside = other.path().join("secret.txt");
        tokio::fs::write(&outside, b"x").await.unwrap();

        let err = resolve_existing_path(outside.to_str().unwrap(), &roots)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathForbidden(_)));
    }

    #[tokio::test]
    async fn test_symlink_escape_is_forbidden() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let target = outside.path().join("real.txt");
        tokio::fs::write(&target, b"x").await.unwrap();
        let link = dir.path().join("escape.txt");
        #[cfg(unix)]
        tokio::fs::symlink(&target, &link).await.unwrap();
        #[cfg(unix)]
        {
            let err = resolve_existing_path(link.to_str().unwrap(), &roots)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::PathForbidden(_)));
        }
    }

    #[tokio::test]
    async fn test_valid_file_resolves() {
        let dir = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let file = dir.path().join("hello.txt");
        tokio::fs::write(&file, b"hi").await.unwrap();

        let resolved = resolve_existing_path(file.to_str().unwrap(), &roots).await.unwrap();
        assert!(resolved.ends_with("hello.txt"));
    }

    #[tokio::test]
    async fn test_target_may_not_exist_but_parent_must() {
        let dir = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let target = dir.path().join("new-file.bin");
        let resolved = resolve_target_path(target.to_str().unwrap(), &roots).await.unwrap();
        assert!(resolved.ends_with("new-file.bin"));

        let missing_parent = dir.path().join("no-such-dir").join("f.bin");
        let err = resolve_target_path(missing_parent.to_str().unwrap(), &roots)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::PathInvalid(_)));
    }

    #[tokio::test]
    async fn test_directory_target_conflicts() {
        let dir = tempdir().unwrap();
        let roots = vec![dir.path().to_path_buf()];

        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();

        let err = resolve_target_path(sub.to_str().unwrap(), &roots).await.unwrap_err();
        assert!(matches!(err, AppError::ConflictExists(_)));
    }
}
