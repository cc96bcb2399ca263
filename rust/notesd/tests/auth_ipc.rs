mod test_support;

use serde_json::json;
use test_support::{temp_dir, Sidecar, ADMIN_EMAIL, ADMIN_PASSWORD};

#[test]
fn login_by_each_document_type() {
    let workspace = temp_dir("notesd-auth-login");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    sc.ok(
        Some(&admin),
        "admin.users.create",
        json!({
            "email": "laura@colegio.test",
            "firstName": "Laura",
            "lastName": "Ruiz",
            "roleId": 2,
            "nationalId": "1020304050",
            "password": "clave123",
        }),
    );
    sc.ok(
        Some(&admin),
        "admin.users.create",
        json!({
            "email": "jose@colegio.test",
            "firstName": "Jose",
            "roleId": 4,
            "permit": "PPT123456789",
            "password": "clave123",
        }),
    );

    let by_id = sc.ok(
        None,
        "auth.login",
        json!({ "loginMethod": "cedula", "identifier": "1020304050", "password": "clave123" }),
    );
    assert_eq!(by_id["user"]["email"], "laura@colegio.test");
    assert_eq!(by_id["home"], "teacher");

    let by_permit = sc.ok(
        None,
        "auth.login",
        json!({ "loginMethod": "ppt", "identifier": " ppt123456789 ", "password": "clave123" }),
    );
    assert_eq!(by_permit["home"], "guardian");

    let by_email = sc.ok(
        None,
        "auth.login",
        json!({ "loginMethod": "correo", "identifier": "LAURA@colegio.test", "password": "clave123" }),
    );
    assert!(by_email["session"].is_string());

    let code = sc.err_code(
        None,
        "auth.login",
        json!({ "loginMethod": "cedula", "identifier": "12ab", "password": "clave123" }),
    );
    assert_eq!(code, "bad_params");

    let code = sc.err_code(
        None,
        "auth.login",
        json!({ "loginMethod": "correo", "identifier": "laura@colegio.test", "password": "wrong-pass" }),
    );
    assert_eq!(code, "invalid_credentials");

    // Unknown accounts look the same as a wrong password.
    let code = sc.err_code(
        None,
        "auth.login",
        json!({ "loginMethod": "correo", "identifier": "nadie@colegio.test", "password": "clave123" }),
    );
    assert_eq!(code, "invalid_credentials");
}

#[test]
fn sessions_end_on_logout_and_deactivation() {
    let workspace = temp_dir("notesd-auth-sessions");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);
    let teacher_id = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");

    let code = sc.err_code(None, "auth.me", json!({}));
    assert_eq!(code, "unauthenticated");
    let code = sc.err_code(Some("not-a-token"), "auth.me", json!({}));
    assert_eq!(code, "unauthenticated");

    let token = sc.login("profe@colegio.test", "profe-pass");
    let me = sc.ok(Some(&token), "auth.me", json!({}));
    assert_eq!(me["user"]["id"], teacher_id.as_str());

    let out = sc.ok(Some(&token), "auth.logout", json!({}));
    assert_eq!(out["loggedOut"], true);
    let code = sc.err_code(Some(&token), "auth.me", json!({}));
    assert_eq!(code, "unauthenticated");

    let token = sc.login("profe@colegio.test", "profe-pass");
    let toggled = sc.ok(
        Some(&admin),
        "admin.users.toggleActive",
        json!({ "userId": teacher_id }),
    );
    assert_eq!(toggled["active"], false);
    let code = sc.err_code(Some(&token), "auth.me", json!({}));
    assert_eq!(code, "unauthenticated");

    let code = sc.err_code(
        None,
        "auth.login",
        json!({ "loginMethod": "correo", "identifier": "profe@colegio.test", "password": "profe-pass" }),
    );
    assert_eq!(code, "account_inactive");

    let sessions = sc.ok(Some(&admin), "admin.sessions.list", json!({}));
    let closed = sessions["sessions"]
        .as_array()
        .expect("sessions")
        .iter()
        .filter(|s| s["userId"] == teacher_id.as_str() && s["logoutAt"].is_string())
        .count();
    assert_eq!(closed, 2);
}

#[test]
fn change_password_requires_current() {
    let workspace = temp_dir("notesd-auth-password");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let code = sc.err_code(
        Some(&admin),
        "auth.changePassword",
        json!({ "currentPassword": "wrong", "newPassword": "nueva-clave" }),
    );
    assert_eq!(code, "forbidden");

    let code = sc.err_code(
        Some(&admin),
        "auth.changePassword",
        json!({ "currentPassword": ADMIN_PASSWORD, "newPassword": "abc" }),
    );
    assert_eq!(code, "bad_params");

    sc.ok(
        Some(&admin),
        "auth.changePassword",
        json!({ "currentPassword": ADMIN_PASSWORD, "newPassword": "nueva-clave" }),
    );
    let code = sc.err_code(
        None,
        "auth.login",
        json!({ "loginMethod": "correo", "identifier": ADMIN_EMAIL, "password": ADMIN_PASSWORD }),
    );
    assert_eq!(code, "invalid_credentials");
    sc.login(ADMIN_EMAIL, "nueva-clave");
}

#[test]
fn registration_requests_reach_the_admin() {
    let workspace = temp_dir("notesd-auth-register");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let submitted = sc.ok(
        None,
        "auth.register",
        json!({
            "name": "Marta Gomez",
            "email": "marta@escuela.test",
            "phone": "3001234567",
            "schoolName": "Escuela Rural",
            "studentCount": 25,
        }),
    );
    assert_eq!(submitted["request"]["status"], "pendiente");
    let request_id = submitted["request"]["id"].as_str().expect("request id").to_string();

    let list = sc.ok(Some(&admin), "admin.registrations.list", json!({}));
    assert_eq!(list["pendingCount"], 1);
    let notes = sc.ok(Some(&admin), "admin.notifications.list", json!({}));
    assert_eq!(notes["unreadCount"], 1);

    let approved = sc.ok(
        Some(&admin),
        "admin.registrations.approve",
        json!({ "requestId": request_id }),
    );
    let temp = approved["temporaryPassword"].as_str().expect("temp password").to_string();
    assert_eq!(approved["user"]["roleId"], 2);

    let token = sc.login("marta@escuela.test", &temp);
    let me = sc.ok(Some(&token), "auth.me", json!({}));
    assert_eq!(me["home"], "teacher");

    let code = sc.err_code(
        Some(&admin),
        "admin.registrations.approve",
        json!({ "requestId": request_id }),
    );
    assert_eq!(code, "conflict");
}
