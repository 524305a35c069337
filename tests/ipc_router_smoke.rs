mod support;

use serde_json::json;
use support::Sidecar;

#[test]
fn requests_before_workspace_selection() {
    let mut s = Sidecar::spawn("instituted-router-nows");

    let health = s.ok("health", json!({}), None);
    assert!(health["version"].is_string());
    assert!(health["workspacePath"].is_null());

    assert_eq!(s.err_code("courses.list", json!({}), None), "no_workspace");
    assert_eq!(s.err_code("payments.list", json!({}), None), "not_implemented");
    assert_eq!(s.err_code("workspace.select", json!({}), None), "bad_params");

    let bad = s.send_raw("{not json");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");
}

#[test]
fn router_enforces_authentication_per_method() {
    let mut s = Sidecar::start("instituted-router-auth");

    let health = s.ok("health", json!({}), None);
    assert!(health["workspacePath"].is_string());

    // Public methods work anonymously, and a stale token is ignored there.
    let courses = s.ok("courses.list", json!({}), None);
    assert_eq!(courses["count"], 0);
    s.ok("courses.list", json!({}), Some("not-a-real-token"));

    assert_eq!(s.err_code("users.profile", json!({}), None), "unauthorized");
    assert_eq!(
        s.err_code("users.profile", json!({}), Some("not-a-real-token")),
        "unauthorized"
    );

    let (_, token) = s.signup("Sam Student", "sam@institute.test", "student");
    let bearer = format!("Bearer {}", token);
    let me = s.ok("users.profile", json!({}), Some(&bearer));
    assert_eq!(me["user"]["email"], "sam@institute.test");

    assert_eq!(
        s.err_code("courses.create", json!({}), Some(&token)),
        "forbidden"
    );
    assert_eq!(
        s.err_code("dashboard.teacher", json!({}), Some(&token)),
        "forbidden"
    );

    s.ok("auth.logout", json!({}), Some(&token));
    assert_eq!(
        s.err_code("users.profile", json!({}), Some(&token)),
        "unauthorized"
    );
}

#[test]
fn workspace_reopen_keeps_data() {
    let mut s = Sidecar::start("instituted-router-reopen");
    s.signup("Ada Admin", "admin@institute.test", "admin");
    let ws = s.workspace.to_string_lossy().to_string();
    s.ok("workspace.select", json!({ "path": ws }), None);
    let token = s.login("admin@institute.test");
    let me = s.ok("users.profile", json!({}), Some(&token));
    assert_eq!(me["user"]["role"], "admin");
}
