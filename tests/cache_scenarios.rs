use std::fs;
use tempfile::TempDir;
use tenant_sql_cache::store::JsonFileBackend;
use tenant_sql_cache::{
    template_key, validate, AccessScope, AssistantConfig, AuthorizedIds, MatchKind,
    RecordOutcome, RoleScopedCache, TemplateStore, Tier, Verdict,
};

fn ids(values: &[u64]) -> AuthorizedIds {
    AuthorizedIds::new(values.iter().copied())
}

fn tenant(values: &[u64]) -> AccessScope {
    AccessScope::Tenant(ids(values))
}

fn parent_cache(dir: &TempDir) -> RoleScopedCache {
    let backend = JsonFileBackend::new(dir.path().join("parent.json"));
    RoleScopedCache::new(Tier::Tenant, TemplateStore::open("parent", Box::new(backend)))
}

#[test]
fn test_template_is_reused_by_another_parent_after_restart() {
    let dir = TempDir::new().unwrap();
    let question = "devoir de contrôle de maths de mon fils";
    let sql = "SELECT n.dc1 FROM noteeval n JOIN eleve e ON n.IdEleve = e.id \
               JOIN matiere m ON n.IdMatiere = m.id \
               WHERE e.IdPersonne IN (7012) AND m.NomMatiereFr = 'Maths'";

    let outcome = parent_cache(&dir).record(question, sql, &tenant(&[7012])).unwrap();
    assert!(matches!(outcome, RecordOutcome::Stored { .. }));

    let on_disk: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("parent.json")).unwrap()).unwrap();
    for entry in on_disk.as_object().unwrap().values() {
        let sql_template = entry["sql_template"].as_str().unwrap();
        assert!(!sql_template.contains("7012"));
        assert!(sql_template.contains("{id_personne}"));
    }

    let cache = parent_cache(&dir);
    let hit = cache.lookup(question, &tenant(&[7716])).unwrap().unwrap();
    assert_eq!(hit.match_kind, MatchKind::Exact);
    assert!(hit.sql.contains("e.IdPersonne IN (7716)"));
    assert!(validate(&hit.sql, &ids(&[7716])));
    assert!(!validate(&hit.sql, &ids(&[7012])));
}

#[test]
fn test_multi_child_template_follows_the_current_set() {
    let dir = TempDir::new().unwrap();
    let cache = parent_cache(&dir);
    let sql = "SELECT a.* FROM absence a JOIN eleve e ON a.eleve = e.id \
               WHERE e.IdPersonne IN (7012,7716)";
    cache
        .record("absences de mes enfants", sql, &tenant(&[7012, 7716]))
        .unwrap();

    let hit = cache
        .lookup("absences de mes enfants", &tenant(&[8001, 8002]))
        .unwrap()
        .unwrap();
    assert!(hit.sql.ends_with("e.IdPersonne IN (8001,8002)"));
    assert!(validate(&hit.sql, &ids(&[8001, 8002])));

    let hit = cache
        .lookup("absences de mes enfants", &tenant(&[8001]))
        .unwrap()
        .unwrap();
    assert!(hit.sql.ends_with("e.IdPersonne IN (8001)"));
    assert!(validate(&hit.sql, &ids(&[8001])));
    assert!(!validate(&hit.sql, &ids(&[8002])));
}

#[test]
fn test_tampered_template_is_caught_before_execution() {
    let dir = TempDir::new().unwrap();
    let question = "absences de mon fils";
    let mut file = serde_json::Map::new();
    file.insert(
        template_key(question),
        serde_json::json!({
            "question_template": "absences de {family_relation}",
            "sql_template": "SELECT * FROM absence WHERE IdPersonne = {id_personne} OR IdPersonne = 9999"
        }),
    );
    fs::write(
        dir.path().join("parent.json"),
        serde_json::Value::Object(file).to_string(),
    )
    .unwrap();

    let cache = parent_cache(&dir);
    let scope = tenant(&[7012]);
    let hit = cache.lookup(question, &scope).unwrap().unwrap();
    assert_eq!(scope.authorize(&hit.sql), Verdict::ForeignIdentity(9999));
    assert!(scope.ensure_authorized(&hit.sql).is_err());
}

#[test]
fn test_legacy_file_is_migrated_on_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parent.json");
    let file = serde_json::json!({
        "5d41402abc4b2a76b9719d911017c592": {
            "question_template": "absences de {{family_relation}}",
            "sql_template": "SELECT * FROM absence WHERE IdPersonne = {{id_personne}}"
        }
    });
    fs::write(&path, serde_json::to_string_pretty(&file).unwrap()).unwrap();

    let cache = parent_cache(&dir);
    assert_eq!(cache.store().len(), 1);

    let rewritten = fs::read_to_string(&path).unwrap();
    assert!(!rewritten.contains("{{"));
    assert!(rewritten.contains(&template_key("absences de mon fils")));

    let hit = cache
        .lookup("absences de ma fille", &tenant(&[7012]))
        .unwrap()
        .unwrap();
    assert_eq!(hit.sql, "SELECT * FROM absence WHERE IdPersonne = 7012");
}

#[test]
fn test_corrupt_file_starts_empty_and_recovers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("parent.json");
    fs::write(&path, "{\"truncated\": {\"question_temp").unwrap();

    let cache = parent_cache(&dir);
    assert!(cache.store().is_empty());
    assert!(cache
        .lookup("absences de mon fils", &tenant(&[7012]))
        .unwrap()
        .is_none());

    cache
        .record(
            "absences de mon fils",
            "SELECT * FROM absence WHERE IdPersonne = 7012",
            &tenant(&[7012]),
        )
        .unwrap();
    assert_eq!(parent_cache(&dir).store().len(), 1);
}

#[test]
fn test_tiers_open_from_config_with_sqlite() {
    let dir = TempDir::new().unwrap();
    let admin_path = dir.path().join("admin.db");
    let parent_path = dir.path().join("parent.db");
    let admin_path_str = admin_path.to_string_lossy().to_string();
    let parent_path_str = parent_path.to_string_lossy().to_string();

    let config = AssistantConfig::from_lookup(|key| match key {
        "CACHE_BACKEND" => Some("sqlite".to_string()),
        "ADMIN_CACHE_PATH" => Some(admin_path_str.clone()),
        "PARENT_CACHE_PATH" => Some(parent_path_str.clone()),
        _ => None,
    })
    .unwrap();

    let admin = RoleScopedCache::from_config(&config, Tier::Unrestricted).unwrap();
    assert_eq!(admin.threshold(), 0.90);
    admin
        .record(
            "liste des élèves de 7B2",
            "SELECT p.NomFr FROM eleve e JOIN personne p ON e.IdPersonne = p.id \
             JOIN inscriptioneleve ie ON e.id = ie.Eleve \
             JOIN classe c ON ie.Classe = c.id WHERE c.CODECLASSEFR = '7B2'",
            &AccessScope::Unrestricted,
        )
        .unwrap();

    let reopened = RoleScopedCache::from_config(&config, Tier::Unrestricted).unwrap();
    let hit = reopened
        .lookup("liste des élèves de 6A1", &AccessScope::Unrestricted)
        .unwrap()
        .unwrap();
    assert!(hit.sql.ends_with("c.CODECLASSEFR = '6A1'"));

    // The parent tier has its own storage.
    let parent = RoleScopedCache::from_config(&config, Tier::Tenant).unwrap();
    assert!(parent.store().is_empty());
    assert_eq!(parent.threshold(), 0.85);
}
