//! First-time access message.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use super::{Attachment, Notification};
use crate::{instance::Instance, keystore::KeyPair, registry::User};

const SECURITY_GUIDANCE: &[&str] = &[
    "Keep this private key secure and never share it",
    "Store it in a safe location (e.g. ~/.ssh/)",
    "Set proper permissions: chmod 600 <key file>",
    "Never commit private keys to version control",
];

/// Attachment filename for a user's private key.
pub fn attachment_name(username: &str) -> String {
    format!("{username}_private_key")
}

pub fn subject(username: &str, instances: &[Instance]) -> String {
    match instances {
        [only] => format!("SSH access for {username} on {}", only.id),
        _ => format!("SSH access for {username}"),
    }
}

/// Build the message for a newly created keypair.
///
/// `instances` are the hosts the key was provisioned to in this run.
pub fn compose_notification(
    user: &User,
    keypair: &KeyPair,
    instances: &[Instance],
    generated_at: DateTime<Utc>,
) -> Notification {
    let key_file = attachment_name(&user.username);
    let generated = generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string();

    Notification {
        subject: subject(&user.username, instances),
        text_body: text_body(user, keypair, instances, &generated, &key_file),
        html_body: html_body(user, keypair, instances, &generated, &key_file),
        attachment: Attachment {
            filename: key_file,
            content: keypair.private_key.clone(),
        },
    }
}

fn describe(instance: &Instance) -> (String, &str, &str) {
    let scope = instance.scope.as_deref().unwrap_or("-");
    let kind = instance.instance_type.as_deref().unwrap_or("-");
    let label = match &instance.name {
        Some(name) if name != &instance.id => format!("{} ({name})", instance.id),
        _ => instance.id.clone(),
    };
    (label, kind, scope)
}

fn text_body(
    user: &User,
    keypair: &KeyPair,
    instances: &[Instance],
    generated: &str,
    key_file: &str,
) -> String {
    let mut body = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(body, "SSH access for {}", user.username);
    let _ = writeln!(body);
    let _ = writeln!(body, "Username:  {}", user.username);
    let _ = writeln!(body, "Full name: {}", user.full_name);
    let _ = writeln!(body, "Generated: {generated}");
    let _ = writeln!(body);
    let _ = writeln!(body, "Instances:");
    for instance in instances {
        let (label, kind, scope) = describe(instance);
        let _ = writeln!(
            body,
            "- {label}: {} (type {kind}, scope {scope})",
            instance.address
        );
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Key details:");
    let _ = writeln!(body, "- Key type:    {}", keypair.algorithm.description());
    let _ = writeln!(body, "- Fingerprint: {}", keypair.fingerprint);
    let _ = writeln!(body, "- Format:      OpenSSH");
    let _ = writeln!(body, "- Attachment:  {key_file}");
    let _ = writeln!(body);
    let _ = writeln!(body, "How to use:");
    let _ = writeln!(body, "1. Save the attached private key as {key_file}");
    let _ = writeln!(body, "2. chmod 600 {key_file}");
    for (i, instance) in instances.iter().enumerate() {
        let step = if i == 0 { "3." } else { "  " };
        let _ = writeln!(
            body,
            "{step} ssh -i {key_file} {}@{}",
            user.username, instance.address
        );
    }
    let _ = writeln!(body);
    let _ = writeln!(body, "Security:");
    for line in SECURITY_GUIDANCE {
        let _ = writeln!(body, "- {line}");
    }
    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "This is an automated message. Contact your administrator with questions."
    );
    body
}

fn html_body(
    user: &User,
    keypair: &KeyPair,
    instances: &[Instance],
    generated: &str,
    key_file: &str,
) -> String {
    let username = escape_html(&user.username);
    let key_file = escape_html(key_file);

    let mut rows = String::new();
    let mut commands = String::new();
    for instance in instances {
        let (label, kind, scope) = describe(instance);
        let address = escape_html(&instance.address);
        let _ = write!(
            rows,
            "<tr><td>{}</td><td>{address}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&label),
            escape_html(kind),
            escape_html(scope),
        );
        let _ = write!(
            commands,
            "<li><code>ssh -i {key_file} {username}@{address}</code></li>"
        );
    }

    let guidance: String = SECURITY_GUIDANCE
        .iter()
        .map(|line| format!("<li>{}</li>", escape_html(line)))
        .collect();

    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>SSH access for {username}</title></head>
<body style="font-family: Arial, sans-serif; margin: 20px;">
<h2>SSH access for {username}</h2>
<p><strong>Username:</strong> {username}<br>
<strong>Full name:</strong> {full_name}<br>
<strong>Generated:</strong> {generated}</p>
<h3>Instances</h3>
<table border="1" cellpadding="4" cellspacing="0">
<tr><th>Instance</th><th>Address</th><th>Type</th><th>Scope</th></tr>
{rows}
</table>
<h3>Key details</h3>
<ul>
<li><strong>Key type:</strong> {algorithm}</li>
<li><strong>Fingerprint:</strong> <code>{fingerprint}</code></li>
<li><strong>Format:</strong> OpenSSH</li>
<li><strong>Attachment:</strong> {key_file}</li>
</ul>
<h3>How to use</h3>
<ol>
<li>Save the attached private key as <code>{key_file}</code></li>
<li><code>chmod 600 {key_file}</code></li>
<li>Connect:<ul>{commands}</ul></li>
</ol>
<div style="background-color: #fff3cd; padding: 10px;">
<h4>Security</h4>
<ul>{guidance}</ul>
</div>
<p style="color: #6c757d;"><em>This is an automated message. Contact your administrator with questions.</em></p>
</body>
</html>
"#,
        full_name = escape_html(&user.full_name),
        generated = escape_html(generated),
        algorithm = escape_html(keypair.algorithm.description()),
        fingerprint = escape_html(&keypair.fingerprint),
    )
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
