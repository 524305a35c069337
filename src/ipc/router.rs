use super::handlers;
use super::helpers::{Ctx, HandlerErr};
use super::types::{AppState, Request};
use crate::auth::{self, Access, Role};
use crate::ipc::error::err;

const ADMIN: &[Role] = &[Role::Admin];
const TEACHER: &[Role] = &[Role::Teacher];
const STUDENT: &[Role] = &[Role::Student];
const STAFF: &[Role] = &[Role::Admin, Role::Teacher];

/// Access policy for every workspace method. Methods missing here are
/// unknown to the router.
fn access_for(method: &str) -> Option<Access> {
    let access = match method {
        "auth.signup"
        | "auth.login"
        | "auth.verifyEmail"
        | "auth.resendVerification"
        | "courses.list"
        | "batches.listByCourse" => Access::Public,

        "auth.logout"
        | "users.profile"
        | "users.updateProfile"
        | "users.changePassword"
        | "enrollments.enroll"
        | "enrollments.byStudent"
        | "attendance.byBatch"
        | "attendance.byStudent"
        | "exams.studentResults"
        | "results.studentPerformance"
        | "results.get"
        | "reports.studentPerformance"
        | "dashboard.get" => Access::Authenticated,

        "teachers.create"
        | "teachers.list"
        | "teachers.get"
        | "courses.create"
        | "courses.update"
        | "courses.delete"
        | "batches.assignStudent"
        | "batches.delete"
        | "enrollments.updateStatus"
        | "reports.allCoursesEnrollment"
        | "dashboard.admin" => Access::Roles(ADMIN),

        "batches.create"
        | "batches.update"
        | "enrollments.byCourse"
        | "enrollments.assignBatch"
        | "attendance.mark"
        | "attendance.stats"
        | "exams.create"
        | "exams.results"
        | "results.delete"
        | "reports.batchPerformance"
        | "reports.courseEnrollment" => Access::Roles(STAFF),

        "exams.update" | "exams.assignMarks" | "results.assignMultiple" | "dashboard.teacher" => {
            Access::Roles(TEACHER)
        }

        "enrollments.mine" | "reports.myPerformance" | "dashboard.student" => {
            Access::Roles(STUDENT)
        }

        _ => return None,
    };
    Some(access)
}

fn log_outcome(method: &str, resp: &serde_json::Value) {
    match resp.get("error").and_then(|e| e.get("code")).and_then(|c| c.as_str()) {
        None => log::debug!("event=request module=ipc method={} status=ok", method),
        Some(code) if code == "db_query_failed" || code == "invalid_exam_configuration" => {
            log::error!(
                "event=request module=ipc method={} status=error code={}",
                method,
                code
            )
        }
        Some(code) => log::warn!(
            "event=request module=ipc method={} status=rejected code={}",
            method,
            code
        ),
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    let resp = route(state, &req);
    log_outcome(&req.method, &resp);
    resp
}

fn route(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, req) {
        return resp;
    }

    let Some(access) = access_for(&req.method) else {
        return err(
            &req.id,
            "not_implemented",
            format!("unknown method: {}", req.method),
            None,
        );
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let token = req
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let caller = match token {
        None => None,
        Some(t) => match auth::resolve_session(conn, t) {
            Ok(c) => Some(c),
            // A stale token on a public method is treated as anonymous.
            Err(_) if access == Access::Public => None,
            Err(e) => return HandlerErr::from(e).response(&req.id),
        },
    };
    if let Err(e) = auth::authorize(access, caller.as_ref()) {
        return HandlerErr::from(e).response(&req.id);
    }

    let ctx = Ctx {
        conn,
        caller: caller.as_ref(),
        config: &state.config,
        token,
    };
    handlers::auth::try_handle(&ctx, req)
        .or_else(|| handlers::users::try_handle(&ctx, req))
        .or_else(|| handlers::courses::try_handle(&ctx, req))
        .or_else(|| handlers::batches::try_handle(&ctx, req))
        .or_else(|| handlers::enrollments::try_handle(&ctx, req))
        .or_else(|| handlers::attendance::try_handle(&ctx, req))
        .or_else(|| handlers::exams::try_handle(&ctx, req))
        .or_else(|| handlers::reports::try_handle(&ctx, req))
        .or_else(|| handlers::dashboard::try_handle(&ctx, req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_table_covers_role_scoped_methods() {
        assert_eq!(access_for("courses.list"), Some(Access::Public));
        assert_eq!(access_for("courses.create"), Some(Access::Roles(ADMIN)));
        assert_eq!(access_for("attendance.mark"), Some(Access::Roles(STAFF)));
        assert_eq!(access_for("exams.assignMarks"), Some(Access::Roles(TEACHER)));
        assert_eq!(access_for("reports.myPerformance"), Some(Access::Roles(STUDENT)));
        assert_eq!(access_for("dashboard.get"), Some(Access::Authenticated));
        assert_eq!(access_for("auth.verifyEmail"), Some(Access::Public));
        assert_eq!(access_for("payments.list"), None);
    }
}
