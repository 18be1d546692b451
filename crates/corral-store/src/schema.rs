//! Final relational schema.
//!
//! The schema is created in full when a store is opened against an empty
//! database; historical migrations are not replayed here.

use rusqlite::Connection;

use corral_common::{Error, Result};

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cluster_template (
    uuid                  TEXT PRIMARY KEY,
    name                  TEXT NOT NULL,
    project_id            TEXT NOT NULL,
    user_id               TEXT NOT NULL,
    image_ref             TEXT NOT NULL,
    flavor                TEXT,
    master_flavor         TEXT,
    keypair               TEXT,
    external_network      TEXT,
    fixed_network         TEXT,
    fixed_subnet          TEXT,
    network_driver        TEXT,
    volume_driver         TEXT,
    dns_nameserver        TEXT,
    apiserver_port        INTEGER,
    docker_volume_size    INTEGER,
    docker_storage_driver TEXT,
    cluster_distro        TEXT NOT NULL,
    coe                   TEXT NOT NULL,
    labels                TEXT NOT NULL DEFAULT '{}',
    http_proxy            TEXT,
    https_proxy           TEXT,
    no_proxy              TEXT,
    registry_enabled      INTEGER NOT NULL DEFAULT 0,
    tls_disabled          INTEGER NOT NULL DEFAULT 0,
    public                INTEGER NOT NULL DEFAULT 0,
    hidden                INTEGER NOT NULL DEFAULT 0,
    server_type           TEXT NOT NULL DEFAULT 'vm',
    insecure_registry     TEXT,
    master_lb_enabled     INTEGER NOT NULL DEFAULT 0,
    floating_ip_enabled   INTEGER NOT NULL DEFAULT 1,
    tags                  TEXT,
    driver                TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT
);

CREATE TABLE IF NOT EXISTS cluster (
    uuid                    TEXT PRIMARY KEY,
    name                    TEXT NOT NULL,
    project_id              TEXT NOT NULL,
    user_id                 TEXT NOT NULL,
    cluster_template_id     TEXT NOT NULL,
    stack_id                TEXT,
    status                  TEXT NOT NULL,
    status_reason           TEXT,
    health_status           TEXT NOT NULL DEFAULT 'UNKNOWN',
    health_status_reason    TEXT NOT NULL DEFAULT '{}',
    create_timeout          INTEGER NOT NULL,
    api_address             TEXT,
    discovery_url           TEXT,
    coe_version             TEXT,
    container_version       TEXT,
    trustee_username        TEXT,
    trustee_user_id         TEXT,
    trustee_password        TEXT,
    trust_id                TEXT,
    ca_cert_ref             TEXT,
    client_cert_ref         TEXT,
    etcd_ca_cert_ref        TEXT,
    front_proxy_ca_cert_ref TEXT,
    keypair                 TEXT,
    docker_volume_size      INTEGER,
    labels                  TEXT NOT NULL DEFAULT '{}',
    master_flavor_id        TEXT,
    flavor_id               TEXT,
    fixed_network           TEXT,
    fixed_subnet            TEXT,
    floating_ip_enabled     INTEGER NOT NULL DEFAULT 1,
    master_lb_enabled       INTEGER NOT NULL DEFAULT 0,
    created_at              TEXT NOT NULL,
    updated_at              TEXT,
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS nodegroup (
    uuid            TEXT PRIMARY KEY,
    cluster_id      TEXT NOT NULL,
    project_id      TEXT NOT NULL,
    name            TEXT NOT NULL,
    role            TEXT NOT NULL,
    flavor_id       TEXT,
    image_id        TEXT,
    node_count      INTEGER NOT NULL,
    min_node_count  INTEGER NOT NULL DEFAULT 0,
    max_node_count  INTEGER,
    node_addresses  TEXT NOT NULL DEFAULT '[]',
    labels          TEXT NOT NULL DEFAULT '{}',
    status          TEXT NOT NULL,
    status_reason   TEXT,
    version         TEXT,
    stack_id        TEXT,
    is_default      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT,
    UNIQUE (cluster_id, name)
);

CREATE TABLE IF NOT EXISTS x509keypair (
    uuid                   TEXT PRIMARY KEY,
    cluster_uuid           TEXT NOT NULL,
    project_id             TEXT NOT NULL,
    user_id                TEXT NOT NULL,
    name                   TEXT NOT NULL,
    certificate            TEXT NOT NULL,
    private_key            TEXT NOT NULL,
    private_key_passphrase TEXT,
    intermediates          TEXT,
    created_at             TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quota (
    project_id TEXT NOT NULL,
    resource   TEXT NOT NULL,
    hard_limit INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (project_id, resource)
);

CREATE TABLE IF NOT EXISTS service_record (
    host            TEXT NOT NULL,
    binary          TEXT NOT NULL,
    last_seen_up    TEXT NOT NULL,
    report_count    INTEGER NOT NULL DEFAULT 0,
    disabled        INTEGER NOT NULL DEFAULT 0,
    forced_down     INTEGER NOT NULL DEFAULT 0,
    disabled_reason TEXT,
    PRIMARY KEY (host, binary)
);

CREATE TABLE IF NOT EXISTS cluster_lock (
    cluster_uuid TEXT PRIMARY KEY,
    conductor_id TEXT NOT NULL,
    taken_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS federation (
    uuid           TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    project_id     TEXT NOT NULL,
    hostcluster_id TEXT NOT NULL,
    member_ids     TEXT NOT NULL DEFAULT '[]',
    properties     TEXT NOT NULL DEFAULT '{}',
    status         TEXT NOT NULL,
    status_reason  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT,
    UNIQUE (project_id, name)
);

CREATE INDEX IF NOT EXISTS idx_cluster_project ON cluster (project_id);
CREATE INDEX IF NOT EXISTS idx_cluster_template_ref ON cluster (cluster_template_id);
CREATE INDEX IF NOT EXISTS idx_nodegroup_cluster ON nodegroup (cluster_id);
CREATE INDEX IF NOT EXISTS idx_x509_cluster ON x509keypair (cluster_uuid);
"#;

pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    // WAL keeps readers unblocked while a conductor writes; the busy
    // timeout covers short cross-process contention on the lock table.
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| Error::database(e.to_string()))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| Error::database(e.to_string()))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| Error::database(e.to_string()))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}
