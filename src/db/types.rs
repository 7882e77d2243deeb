use derive_more::{Display, From, Into};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

macro_rules! generate_id_field {
    ( $name:ident ) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
        pub struct $name(i64);

        impl $name {
            pub fn new(value: i64) -> $name {
                $name(value)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map($name)
            }
        }
    };
}

generate_id_field! {
    RecordId
}

generate_id_field! {
    UserAgentId
}

#[cfg(test)]
mod tests {
    use super::UserAgentId;
    use rusqlite::{params, Connection};

    #[test]
    fn id_binds_and_reads_back() {
        let conn = Connection::open_in_memory().unwrap();
        let id: UserAgentId = conn
            .query_row("SELECT ?", params![UserAgentId::new(42)], |row| row.get(0))
            .unwrap();
        assert_eq!(UserAgentId::from(42), id);
        let raw: i64 = id.into();
        assert_eq!(42, raw);
        assert_eq!("42", id.to_string());
    }
}
