use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

fn broker_cmd(tmp: &TempDir) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("vault-broker");
    cmd.current_dir(tmp.path());
    cmd
}

#[test]
fn help_works() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(&tmp)
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Usage: vault-broker"))
        .stdout(contains("--bind"))
        .stdout(contains("--backend"));
}

#[test]
fn missing_credentials_fail_fast() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(&tmp)
        .env_clear()
        .args(["--backend", "dev", "--bind", "127.0.0.1:0"])
        .assert()
        .failure()
        .stderr(contains("broker exited with error"))
        .stderr(contains("missing SECURITY_USER_NAME"));
}

#[test]
fn vault_backend_requires_a_token() {
    let tmp = TempDir::new().unwrap();
    broker_cmd(&tmp)
        .env_clear()
        .env("SECURITY_USER_NAME", "broker")
        .env("SECURITY_USER_PASSWORD", "secret")
        .assert()
        .failure()
        .stderr(contains("missing VAULT_TOKEN"));
}
