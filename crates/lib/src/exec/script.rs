//! Shell scripts for host operations.
//!
//! Scripts run under `sh -s` as root. They are idempotent and print a single
//! result word on the last stdout line. Exit codes other than 0 mean the
//! operation failed; the message is on stderr.

use super::shell_quote;

pub fn probe() -> String {
    "set -eu\necho ok\n".to_string()
}

pub fn ensure_account(username: &str) -> String {
    format!(
        r#"set -eu
user={user}
if id -u "$user" >/dev/null 2>&1; then
    echo present
    exit 0
fi
if useradd -m -s /bin/bash "$user" 2>/dev/null || adduser -D -s /bin/sh "$user" 2>/dev/null; then
    echo created
elif id -u "$user" >/dev/null 2>&1; then
    echo present
else
    echo "failed to create account $user" >&2
    exit 3
fi
"#,
        user = shell_quote(username),
    )
}

/// Append the key to `authorized_keys` unless an active line already carries
/// it.
///
/// A line counts only if it is not a comment and has the key type followed by
/// the base64 body as adjacent fields (options before them are allowed).
/// The file is rebuilt in a temp file next to it and renamed into place, so a
/// reader never sees a partial file. Existing lines are preserved verbatim.
pub fn ensure_credential(username: &str, public_key: &str) -> String {
    let public_key = public_key.trim();
    let mut fields = public_key.split_whitespace();
    let key_type = fields.next().unwrap_or_default();
    let key_body = fields.next().unwrap_or_default();
    format!(
        r#"set -eu
user={user}
key={key}
key_type={key_type}
key_body={key_body}
home=$(getent passwd "$user" | cut -d: -f6)
if [ -z "$home" ]; then
    echo "no home directory for $user" >&2
    exit 3
fi
group=$(id -gn "$user")
dir="$home/.ssh"
auth="$dir/authorized_keys"
mkdir -p "$dir"
chown "$user:$group" "$dir"
chmod 700 "$dir"
if [ -f "$auth" ] && awk -v t="$key_type" -v b="$key_body" '
    /^[ \t]*#/ {{ next }}
    {{ for (i = 1; i < NF; i++) if ($i == t && $(i + 1) == b) found = 1 }}
    END {{ exit (found ? 0 : 1) }}' "$auth"; then
    echo present
    exit 0
fi
tmp=$(mktemp "$dir/.authorized_keys.XXXXXX")
trap 'rm -f "$tmp"' EXIT
if [ -f "$auth" ]; then
    cat "$auth" > "$tmp"
    if [ -s "$tmp" ] && [ -n "$(tail -c 1 "$tmp")" ]; then
        echo >> "$tmp"
    fi
fi
printf '%s\n' "$key" >> "$tmp"
chown "$user:$group" "$tmp"
chmod 600 "$tmp"
mv -f "$tmp" "$auth"
trap - EXIT
echo installed
"#,
        user = shell_quote(username),
        key = shell_quote(public_key),
        key_type = shell_quote(key_type),
        key_body = shell_quote(key_body),
    )
}

pub fn verify_permissions(username: &str) -> String {
    format!(
        r#"set -eu
user={user}
home=$(getent passwd "$user" | cut -d: -f6)
for path in "$home/.ssh" "$home/.ssh/authorized_keys"; do
    if [ ! -e "$path" ]; then
        echo "$path is missing" >&2
        exit 4
    fi
    owner=$(stat -c %U "$path")
    mode=$(stat -c %a "$path")
    if [ "$owner" != "$user" ]; then
        echo "$path is owned by $owner" >&2
        exit 4
    fi
    if [ $((0$mode & 077)) -ne 0 ]; then
        echo "$path has mode $mode" >&2
        exit 4
    fi
done
echo ok
"#,
        user = shell_quote(username),
    )
}
