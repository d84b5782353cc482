//! MySQL schema for the collection/task tables and the create procedure.

pub const CREATE_COLLECTION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS herald_collection (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    exec_time BIGINT NOT NULL,
    taken_by_instance VARCHAR(64) NULL,
    INDEX idx_herald_collection_exec_time (exec_time)
) ENGINE = InnoDB
"#;

pub const CREATE_TASK_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS herald_task (
    uuid CHAR(26) NOT NULL PRIMARY KEY,
    collection_id BIGINT NOT NULL,
    INDEX idx_herald_task_collection (collection_id),
    CONSTRAINT fk_herald_task_collection
        FOREIGN KEY (collection_id) REFERENCES herald_collection (id)
) ENGINE = InnoDB
"#;

/// Find-or-create the collection and insert the task in one transaction.
///
/// The candidate collection row is locked `FOR UPDATE`, so concurrent
/// creators for the same `(exec_time, owner)` serialize on it and the
/// capacity check stays accurate.
pub const CREATE_TASK_PROCEDURE: &str = r#"
CREATE PROCEDURE herald_create_task(
    IN p_instance VARCHAR(64),
    IN p_uuid CHAR(26),
    IN p_exec_time BIGINT,
    IN p_is_taken BOOLEAN,
    IN p_capacity INT
)
BEGIN
    DECLARE v_collection BIGINT DEFAULT NULL;
    DECLARE v_owner VARCHAR(64) DEFAULT NULL;
    DECLARE EXIT HANDLER FOR SQLEXCEPTION
    BEGIN
        ROLLBACK;
        RESIGNAL;
    END;

    IF p_is_taken THEN
        SET v_owner = p_instance;
    END IF;

    START TRANSACTION;

    SELECT c.id INTO v_collection
    FROM herald_collection c
    WHERE c.exec_time = p_exec_time
      AND c.taken_by_instance <=> v_owner
      AND (SELECT COUNT(*) FROM herald_task t WHERE t.collection_id = c.id) < p_capacity
    ORDER BY c.id
    LIMIT 1
    FOR UPDATE;

    IF v_collection IS NULL THEN
        INSERT INTO herald_collection (exec_time, taken_by_instance)
        VALUES (p_exec_time, v_owner);
        SET v_collection = LAST_INSERT_ID();
    END IF;

    INSERT INTO herald_task (uuid, collection_id) VALUES (p_uuid, v_collection);

    COMMIT;
END
"#;

pub const CALL_CREATE_TASK: &str = "CALL herald_create_task(?, ?, ?, ?, ?)";

/// `FOR UPDATE SKIP LOCKED`: a collection locked by another instance's
/// claim transaction is skipped rather than waited on and re-read.
pub const SELECT_DUE_COLLECTIONS: &str = r#"
SELECT id
FROM herald_collection
WHERE exec_time <= ?
  AND taken_by_instance IS NULL
ORDER BY exec_time
LIMIT ?
FOR UPDATE SKIP LOCKED
"#;

pub const SELECT_COLLECTION_TASKS: &str = r#"
SELECT t.uuid, c.exec_time
FROM herald_task t
JOIN herald_collection c ON c.id = t.collection_id
WHERE t.collection_id = ?
"#;

pub const DELETE_STALE_COLLECTIONS: &str = r#"
DELETE FROM herald_collection
WHERE exec_time < ?
  AND NOT EXISTS (
      SELECT 1 FROM herald_task t WHERE t.collection_id = herald_collection.id
  )
"#;

pub const COUNT_TASKS: &str = "SELECT COUNT(*) FROM herald_task";

pub const RELEASE_CLAIMS: &str =
    "UPDATE herald_collection SET taken_by_instance = NULL WHERE taken_by_instance = ?";

/// MySQL error numbers the store classifies.
pub mod codes {
    pub const DUPLICATE_ENTRY: u16 = 1062;
    pub const LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const DEADLOCK: u16 = 1213;
    pub const PROCEDURE_EXISTS: u16 = 1304;
}
