use diesel::prelude::*;

#[derive(Queryable, Selectable, Insertable, PartialEq, Debug, Clone)]
#[diesel(table_name = crate::schema::kv_store)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct KvEntry {
    pub(crate) bucket: String,
    pub(crate) key: String,
    pub(crate) value: String,
}
