// Copyright (c) 2023-2024 The Virtrun Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// A user-supplied executable run at sandbox start.
#[derive(Clone, Debug, Default)]
pub struct Hook {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Run hooks in order, each with the sandbox id and the VMM pid in its
/// environment. Before the VM exists the pid variable is left empty.
pub async fn run_prestart_hooks(
    hooks: &[Hook],
    sid: &str,
    vmm_pid: Option<u32>,
) -> Result<()> {
    for hook in hooks {
        let mut cmd = tokio::process::Command::new(&hook.path);
        cmd.args(&hook.args)
            .env("VIRTRUN_SANDBOX_ID", sid)
            .env(
                "VIRTRUN_VMM_PID",
                vmm_pid.map(|p| p.to_string()).unwrap_or_default(),
            )
            .stdin(std::process::Stdio::null());
        for (k, v) in &hook.env {
            cmd.env(k, v);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn hook {:?}", hook.path))?;
        let output = tokio::time::timeout(HOOK_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("hook {:?} timed out", hook.path))?
            .with_context(|| format!("wait hook {:?}", hook.path))?;
        if !output.status.success() {
            return Err(anyhow!(
                "hook {:?} failed: {}",
                hook.path,
                String::from_utf8_lossy(&output.stderr)
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hooks_run_in_order_with_context() {
        let dir = std::env::temp_dir().join(format!("hooks-ut-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("out");
        let hook = Hook {
            path: "/bin/sh".to_string(),
            args: vec![
                "-c".to_string(),
                format!("echo $VIRTRUN_SANDBOX_ID $VIRTRUN_VMM_PID >> {}", out.display()),
            ],
            env: vec![],
        };

        run_prestart_hooks(&[hook.clone()], "sb-hook", None)
            .await
            .unwrap();
        run_prestart_hooks(&[hook], "sb-hook", Some(42)).await.unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "sb-hook");
        assert_eq!(lines[1], "sb-hook 42");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_failing_hook_surfaces() {
        let hook = Hook {
            path: "/bin/false".to_string(),
            ..Default::default()
        };
        assert!(run_prestart_hooks(&[hook], "sb", None).await.is_err());
    }
}
