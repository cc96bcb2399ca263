mod test_support;

use serde_json::json;
use test_support::{temp_dir, Sidecar};

fn admin_id(sc: &mut Sidecar, admin: &str) -> String {
    let me = sc.ok(Some(admin), "auth.me", json!({}));
    me["user"]["id"].as_str().expect("admin id").to_string()
}

#[test]
fn user_management_is_audited() {
    let workspace = temp_dir("notesd-admin-users");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);
    let me = admin_id(&mut sc, &admin);

    let teacher = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");
    let code = sc.err_code(
        Some(&admin),
        "admin.users.create",
        json!({
            "email": "PROFE@colegio.test",
            "firstName": "Otra",
            "roleId": 2,
            "password": "otra-pass",
        }),
    );
    assert_eq!(code, "conflict");

    let updated = sc.ok(
        Some(&admin),
        "admin.users.update",
        json!({
            "userId": teacher,
            "email": "profe@colegio.test",
            "firstName": "Laura",
            "lastName": "Ruiz",
            "roleId": 2,
        }),
    );
    assert_eq!(updated["user"]["firstName"], "Laura");

    let reset = sc.ok(
        Some(&admin),
        "admin.users.resetPassword",
        json!({ "userId": teacher }),
    );
    let temp = reset["temporaryPassword"].as_str().expect("temp").to_string();
    sc.login("profe@colegio.test", &temp);

    let code = sc.err_code(Some(&admin), "admin.users.toggleActive", json!({ "userId": me }));
    assert_eq!(code, "forbidden");
    let code = sc.err_code(Some(&admin), "admin.users.delete", json!({ "userId": me }));
    assert_eq!(code, "forbidden");

    let audit = sc.ok(Some(&admin), "admin.audit.list", json!({ "action": "restablecer" }));
    assert_eq!(audit["total"], 1);
    assert_eq!(audit["entries"][0]["userId"], teacher.as_str());

    let everything = sc.ok(Some(&admin), "admin.audit.list", json!({ "limit": 2 }));
    assert_eq!(everything["total"], 3);
    assert_eq!(everything["entries"].as_array().map(|a| a.len()), Some(2));

    let code = sc.err_code(Some(&admin), "admin.audit.list", json!({ "action": "borrar" }));
    assert_eq!(code, "bad_params");

    let teachers = sc.ok(Some(&admin), "admin.users.list", json!({ "roleId": 2 }));
    assert_eq!(teachers["users"].as_array().map(|a| a.len()), Some(1));

    let token = sc.login("profe@colegio.test", &temp);
    let code = sc.err_code(Some(&token), "admin.users.list", json!({}));
    assert_eq!(code, "forbidden");
}

#[test]
fn authors_cannot_be_deleted() {
    let workspace = temp_dir("notesd-admin-delete");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let teacher = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");
    let idle = sc.create_user(&admin, "idle@colegio.test", 4, "idle-pass");
    let student = sc.create_student(&admin, "Pablo", Some(&teacher));
    let token = sc.login("profe@colegio.test", "profe-pass");
    sc.ok(
        Some(&token),
        "teacher.observations.create",
        json!({
            "studentId": student,
            "title": "Llega tarde",
            "description": "Tres llegadas tarde esta semana.",
            "kind": "Mejora",
        }),
    );

    let code = sc.err_code(Some(&admin), "admin.users.delete", json!({ "userId": teacher }));
    assert_eq!(code, "conflict");

    let idle_token = sc.login("idle@colegio.test", "idle-pass");
    sc.ok(Some(&admin), "admin.users.delete", json!({ "userId": idle }));
    let code = sc.err_code(Some(&idle_token), "auth.me", json!({}));
    assert_eq!(code, "unauthenticated");

    let removed = sc.ok(Some(&admin), "admin.students.delete", json!({ "studentId": student }));
    assert_eq!(removed["deleted"], true);
    let listed = sc.ok(Some(&token), "teacher.observations.list", json!({}));
    assert_eq!(listed["observations"].as_array().map(|a| a.len()), Some(0));
}

#[test]
fn students_and_dashboard() {
    let workspace = temp_dir("notesd-admin-students");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let t1 = sc.create_user(&admin, "t1@colegio.test", 2, "t1-pass");
    let t2 = sc.create_user(&admin, "t2@colegio.test", 2, "t2-pass");
    let guardian = sc.create_user(&admin, "g@colegio.test", 4, "g-pass");
    let student = sc.create_student(&admin, "Elena", Some(&t1));

    let code = sc.err_code(
        Some(&admin),
        "admin.students.setTeacher",
        json!({ "studentId": student, "teacherId": guardian }),
    );
    assert_eq!(code, "bad_params");

    let code = sc.err_code(
        Some(&admin),
        "admin.students.create",
        json!({ "firstName": "X", "lastName": "Y", "grade": "1A", "birthDate": "2015-13-40" }),
    );
    assert_eq!(code, "bad_params");

    let moved = sc.ok(
        Some(&admin),
        "admin.students.setTeacher",
        json!({ "studentId": student, "teacherId": t2 }),
    );
    assert_eq!(moved["student"]["teacherId"], t2.as_str());

    let t1_token = sc.login("t1@colegio.test", "t1-pass");
    let mine = sc.ok(Some(&t1_token), "teacher.students.list", json!({}));
    assert_eq!(mine["students"].as_array().map(|a| a.len()), Some(0));

    let by_teacher = sc.ok(Some(&admin), "admin.students.list", json!({ "teacherId": t2 }));
    assert_eq!(by_teacher["students"].as_array().map(|a| a.len()), Some(1));

    let stats = sc.ok(Some(&admin), "admin.dashboard.stats", json!({}));
    assert_eq!(stats["users"]["total"], 4);
    assert_eq!(stats["users"]["teachers"], 2);
    assert_eq!(stats["students"], 1);
    assert_eq!(stats["observations"], 0);
    assert_eq!(stats["media"]["count"], 0);
    assert!(stats["sessions"]["open"].as_i64().unwrap_or(0) >= 1);
}

#[test]
fn role_edits_cannot_orphan_admin_or_guardian_links() {
    let workspace = temp_dir("notesd-admin-roles");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);
    let me = admin_id(&mut sc, &admin);

    let code = sc.err_code(
        Some(&admin),
        "admin.users.update",
        json!({ "userId": me, "email": "admin@colegio.test", "firstName": "Ada", "roleId": 2 }),
    );
    assert_eq!(code, "forbidden");
    let status = sc.ok(None, "setup.status", json!({}));
    assert_eq!(status["adminExists"], true);
    let code = sc.err_code(
        None,
        "setup.bootstrapAdmin",
        json!({ "email": "intruso@colegio.test", "firstName": "Intruso", "password": "intruso-pass" }),
    );
    assert_eq!(code, "conflict");

    let g1 = sc.create_user(&admin, "g1@colegio.test", 4, "g1-pass");
    let g2 = sc.create_user(&admin, "g2@colegio.test", 4, "g2-pass");
    let g3 = sc.create_user(&admin, "g3@colegio.test", 4, "g3-pass");
    let student = sc.create_student(&admin, "Sofia", None);
    for g in [&g1, &g2] {
        sc.ok(
            Some(&admin),
            "students.guardians.assign",
            json!({ "studentId": student, "guardianId": g }),
        );
    }

    let code = sc.err_code(
        Some(&admin),
        "admin.users.update",
        json!({ "userId": g1, "email": "g1@colegio.test", "firstName": "G1", "roleId": 2 }),
    );
    assert_eq!(code, "conflict");

    sc.ok(
        Some(&admin),
        "students.guardians.remove",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    let moved = sc.ok(
        Some(&admin),
        "admin.users.update",
        json!({ "userId": g1, "email": "g1@colegio.test", "firstName": "G1", "roleId": 2 }),
    );
    assert_eq!(moved["user"]["roleId"], 2);

    // The freed slot goes to a real guardian.
    sc.ok(
        Some(&admin),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g3 }),
    );
}
