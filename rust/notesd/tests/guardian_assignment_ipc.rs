mod test_support;

use serde_json::json;
use test_support::{temp_dir, Sidecar};

fn relation_of(list: &serde_json::Value, guardian_id: &str) -> Option<String> {
    list["guardians"]
        .as_array()
        .expect("guardians array")
        .iter()
        .find(|g| g["guardianId"].as_str() == Some(guardian_id))
        .and_then(|g| g["relationType"].as_str())
        .map(str::to_string)
}

#[test]
fn two_guardian_cap_and_principal_handover() {
    let workspace = temp_dir("notesd-guardians");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let teacher = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");
    let g1 = sc.create_user(&admin, "g1@colegio.test", 4, "g1-pass");
    let g2 = sc.create_user(&admin, "g2@colegio.test", 4, "g2-pass");
    let g3 = sc.create_user(&admin, "g3@colegio.test", 4, "g3-pass");
    let student = sc.create_student(&admin, "Sara", Some(&teacher));

    let first = sc.ok(
        Some(&admin),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    assert_eq!(first["relationType"], "principal");
    assert_eq!(first["message"], "guardian assigned as principal");

    let second = sc.ok(
        Some(&admin),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g2, "relationType": "not-a-type" }),
    );
    assert_eq!(second["relationType"], "secundario");

    let code = sc.err_code(
        Some(&admin),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g3 }),
    );
    assert_eq!(code, "guardian_limit");

    let list = sc.ok(
        Some(&admin),
        "students.guardians.list",
        json!({ "studentId": student }),
    );
    assert_eq!(list["activeCount"], 2);
    // Principal is listed first.
    assert_eq!(list["guardians"][0]["guardianId"], g1.as_str());

    let changed = sc.ok(
        Some(&admin),
        "students.guardians.changeType",
        json!({ "studentId": student, "guardianId": g2, "relationType": "principal" }),
    );
    assert_eq!(changed["demotedGuardianId"], g1.as_str());

    let list = sc.ok(
        Some(&admin),
        "students.guardians.list",
        json!({ "studentId": student }),
    );
    assert_eq!(relation_of(&list, &g1).as_deref(), Some("secundario"));
    assert_eq!(relation_of(&list, &g2).as_deref(), Some("principal"));
}

#[test]
fn removal_keeps_history_and_allows_reassignment() {
    let workspace = temp_dir("notesd-guardians-remove");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let teacher = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");
    let g1 = sc.create_user(&admin, "g1@colegio.test", 4, "g1-pass");
    let student = sc.create_student(&admin, "Tomas", Some(&teacher));
    let teacher_token = sc.login("profe@colegio.test", "profe-pass");

    sc.ok(
        Some(&teacher_token),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    let dup = sc.err_code(
        Some(&teacher_token),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    assert_eq!(dup, "conflict");

    sc.ok(
        Some(&teacher_token),
        "students.guardians.remove",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    let again = sc.err_code(
        Some(&teacher_token),
        "students.guardians.remove",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    assert_eq!(again, "not_found");

    let list = sc.ok(
        Some(&teacher_token),
        "students.guardians.list",
        json!({ "studentId": student }),
    );
    assert_eq!(list["activeCount"], 0);

    let history = sc.ok(
        Some(&teacher_token),
        "students.guardians.history",
        json!({ "studentId": student }),
    );
    let links = history["links"].as_array().expect("links");
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["active"], false);
    assert!(links[0]["removedAt"].is_string());

    sc.ok(
        Some(&teacher_token),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    let history = sc.ok(
        Some(&teacher_token),
        "students.guardians.history",
        json!({ "studentId": student }),
    );
    assert_eq!(history["links"].as_array().map(|a| a.len()), Some(2));

    let available = sc.ok(
        Some(&teacher_token),
        "students.guardians.available",
        json!({ "studentId": student }),
    );
    assert!(available["guardians"]
        .as_array()
        .expect("available")
        .iter()
        .all(|g| g["id"].as_str() != Some(g1.as_str())));
}

#[test]
fn access_is_scoped_by_role() {
    let workspace = temp_dir("notesd-guardians-access");
    let mut sc = Sidecar::spawn();
    let admin = sc.bootstrap(&workspace);

    let teacher = sc.create_user(&admin, "profe@colegio.test", 2, "profe-pass");
    sc.create_user(&admin, "otro@colegio.test", 2, "otro-pass");
    let g1 = sc.create_user(&admin, "g1@colegio.test", 4, "g1-pass");
    let student = sc.create_student(&admin, "Lina", Some(&teacher));

    let other = sc.login("otro@colegio.test", "otro-pass");
    let code = sc.err_code(
        Some(&other),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    assert_eq!(code, "forbidden");

    let guardian = sc.login("g1@colegio.test", "g1-pass");
    let code = sc.err_code(
        Some(&guardian),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    assert_eq!(code, "forbidden");
    let code = sc.err_code(
        Some(&guardian),
        "students.guardians.list",
        json!({ "studentId": student }),
    );
    assert_eq!(code, "forbidden");

    sc.ok(
        Some(&admin),
        "students.guardians.assign",
        json!({ "studentId": student, "guardianId": g1 }),
    );
    let list = sc.ok(
        Some(&guardian),
        "students.guardians.list",
        json!({ "studentId": student }),
    );
    assert_eq!(list["activeCount"], 1);

    let teacher_token = sc.login("profe@colegio.test", "profe-pass");
    let created = sc.ok(
        Some(&teacher_token),
        "teacher.guardians.create",
        json!({
            "studentId": student,
            "email": "nuevo@colegio.test",
            "firstName": "Nuevo",
            "password": "nuevo-pass",
        }),
    );
    assert_eq!(created["assignment"]["relationType"], "secundario");
    assert_eq!(created["guardian"]["roleId"], 4);
}
