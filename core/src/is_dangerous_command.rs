//! Last-resort refusal of destructive commands.
//!
//! This list is evaluated inside the command runner, after policy, and no
//! policy document can disable it. It overlaps with the policy's
//! blocked-commands list on purpose; the two are independent layers.

/// Returns the reason a command must not run, or `None` when it passes.
pub fn dangerous_command_reason(command: &str) -> Option<&'static str> {
    let lowered = command.to_lowercase();

    // Recursive force-remove of a root-ish target.
    for pattern in ["rm -rf /", "rm -fr /", "rm -rf ~", "rm -rf *", "rm -rf .."] {
        if lowered.contains(pattern) {
            return Some("Command contains blocked operation");
        }
    }

    // Redirects or raw writes to block devices.
    if lowered.contains("> /dev/sd")
        || lowered.contains("> /dev/nvme")
        || lowered.contains("of=/dev/")
    {
        return Some("Command contains blocked operation");
    }

    // Filesystem creation wipes whatever the device held.
    if lowered.split_whitespace().any(|token| token.starts_with("mkfs")) {
        return Some("Command contains blocked operation");
    }

    // Classic fork bomb.
    if lowered.contains(":(){") || lowered.contains(":()  {") {
        return Some("Command contains blocked operation");
    }

    // Piping a download (or anything else) straight into a shell or a
    // destructive command.
    for sink in ["| sh", "| bash", "|sh", "|bash", "| rm", "|rm"] {
        if lowered.contains(sink) {
            return Some("Command contains blocked operation");
        }
    }

    // Rewriting the partition table or zeroing disks.
    if lowered.contains("dd if=") && lowered.contains("/dev/") {
        return Some("Command contains blocked operation");
    }

    None
}

pub fn is_dangerous_command(command: &str) -> bool {
    dangerous_command_reason(command).is_some()
}
