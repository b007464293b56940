use actix_web::web::{Data, Json, Path, ServiceConfig};
use actix_web::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::error::Error;
use crate::user::{Identity, Role, UserId};

use super::{manager, Account, Amount};

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CreditAccountBody {
    pub amount: Amount,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AccountBody {
    pub user_id: UserId,
    pub role: Role,
    pub balance: Amount,
    pub pending: Amount,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl AccountBody {
    pub fn render(account: Account) -> AccountBody {
        AccountBody {
            user_id: account.id,
            role: account.role,
            balance: account.balance,
            pending: account.pending,
            created_at: account.created_at,
            modified_at: account.modified_at,
        }
    }
}

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.service(get_own_account).service(credit_account);
}

#[get("/accounts/me")]
#[tracing::instrument(skip(db))]
async fn get_own_account(
    db: Data<dyn Database>,
    identity: Identity,
) -> Result<Json<AccountBody>, Error> {
    let account = manager::open_account(db.get_ref(), identity.user_id, identity.role).await?;

    Ok(Json(AccountBody::render(account)))
}

#[post("/accounts/{user_id}/credits")]
#[tracing::instrument(skip(db))]
async fn credit_account(
    db: Data<dyn Database>,
    identity: Identity,
    params: Path<UserId>,
    body: Json<CreditAccountBody>,
) -> Result<Json<AccountBody>, Error> {
    identity.require(Role::Admin)?;
    let user_id = params.into_inner();

    let account = manager::credit_account(db.get_ref(), user_id, body.amount).await?;

    Ok(Json(AccountBody::render(account)))
}
