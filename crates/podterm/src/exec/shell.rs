//! Shell probing and selection.

use log::debug;

use crate::cluster::{ClusterApi, ExecRequest};

/// Shells tried by the multiplexer, in order.
pub const SUPPORTED_SHELLS: [&str; 4] = ["bash", "sh", "powershell", "cmd"];

pub const POD_NOT_FOUND: &str = "Pod NotFound";
pub const COMMAND_EXECUTION_FAILED: &str = "Failed to Execute Command";
pub const NO_SHELL_SUPPORTED: &str = "no shell is supported";

pub fn is_supported_shell(shell: &str) -> bool {
    SUPPORTED_SHELLS.contains(&shell)
}

/// `requested` first when it is supported, then the rest of the list.
pub(super) fn shell_order(requested: &str) -> Vec<&'static str> {
    let mut order: Vec<&'static str> = SUPPORTED_SHELLS
        .iter()
        .copied()
        .filter(|s| *s == requested)
        .collect();
    order.extend(SUPPORTED_SHELLS.iter().copied().filter(|s| *s != requested));
    order
}

fn classify(message: &str) -> &'static str {
    if message.contains("pods") && message.contains("not found") {
        POD_NOT_FOUND
    } else {
        COMMAND_EXECUTION_FAILED
    }
}

/// Run `/bin/<shell>` without a tty. Any exec error or stderr output means the shell is not
/// usable; the error is [`POD_NOT_FOUND`] or [`COMMAND_EXECUTION_FAILED`].
pub async fn check_shell(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    shell: &str,
) -> Result<(), &'static str> {
    let request = ExecRequest::command(namespace, pod, container, vec![format!("/bin/{shell}")]);
    match cluster.exec_output(&request).await {
        Err(e) => {
            debug!("probing {} in {}/{} failed: {}", shell, namespace, pod, e);
            Err(classify(&e.to_string()))
        }
        Ok(output) if !output.stderr.is_empty() => {
            debug!("probing {} in {}/{}: {}", shell, namespace, pod, output.stderr.trim());
            Err(classify(&output.stderr))
        }
        Ok(_) => Ok(()),
    }
}

/// First supported shell that exists in the container.
pub async fn auto_select_shell(
    cluster: &dyn ClusterApi,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
) -> Result<&'static str, &'static str> {
    let mut last_error = COMMAND_EXECUTION_FAILED;
    for shell in SUPPORTED_SHELLS {
        match check_shell(cluster, namespace, pod, container, shell).await {
            Ok(()) => return Ok(shell),
            Err(e) => last_error = e,
        }
    }
    if last_error == COMMAND_EXECUTION_FAILED {
        Err(NO_SHELL_SUPPORTED)
    } else {
        Err(last_error)
    }
}
